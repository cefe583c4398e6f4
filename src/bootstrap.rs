//! Per-user library bootstrap.
//!
//! A user's scoped root is seeded from the service's base template. Files that
//! already exist at the destination are never touched, so re-running bootstrap
//! after a user has edited their library is safe.

use crate::config::{expand_path, SchemaKind, SchemaSettings};
use crate::envfile::read_env_values;
use crate::error::StewardError;
use crate::registry::ServiceDescriptor;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

const USER_ID_PATTERN: &str = r"^[A-Za-z0-9_]{3,128}$";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BootstrapReport {
    pub user_id: String,
    pub scoped_root: PathBuf,
    pub changed_paths: Vec<String>,
}

/// Creates whatever structure a service expects inside a freshly scoped root.
///
/// Implementations report the paths they created, relative to `scoped_root`,
/// and must leave existing files alone.
pub trait SchemaNormalizer {
    fn normalize(&self, scoped_root: &Path) -> Result<Vec<String>, StewardError>;
}

pub struct NoSchema;

impl SchemaNormalizer for NoSchema {
    fn normalize(&self, _scoped_root: &Path) -> Result<Vec<String>, StewardError> {
        Ok(Vec::new())
    }
}

/// Ensures a fixed set of directories and empty files exist.
pub struct ScaffoldSchema {
    pub directories: Vec<String>,
    pub files: Vec<String>,
}

impl SchemaNormalizer for ScaffoldSchema {
    fn normalize(&self, scoped_root: &Path) -> Result<Vec<String>, StewardError> {
        let mut changed = Vec::new();
        for dir in &self.directories {
            let rel = safe_relative(dir)?;
            let path = scoped_root.join(&rel);
            if !path.is_dir() {
                fs::create_dir_all(&path)?;
                changed.push(posix(&rel));
            }
        }
        for file in &self.files {
            let rel = safe_relative(file)?;
            let path = scoped_root.join(&rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => changed.push(posix(&rel)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(changed)
    }
}

pub fn normalizer_for(schema: &SchemaSettings) -> Box<dyn SchemaNormalizer + Send + Sync> {
    match schema.kind {
        SchemaKind::None => Box::new(NoSchema),
        SchemaKind::Scaffold => Box::new(ScaffoldSchema {
            directories: schema.directories.clone(),
            files: schema.files.clone(),
        }),
    }
}

fn safe_relative(raw: &str) -> Result<PathBuf, StewardError> {
    let path = Path::new(raw.trim());
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    if raw.trim().is_empty() || escapes {
        return Err(StewardError::Bootstrap(format!(
            "schema path must be relative and stay inside the scoped root: {raw:?}"
        )));
    }
    Ok(path.to_path_buf())
}

fn posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Dashes are dropped before the allow-list check, so UUIDs are accepted.
pub fn normalize_user_id(raw: &str) -> Result<String, StewardError> {
    let normalized = raw.trim().replace('-', "");
    let pattern =
        Regex::new(USER_ID_PATTERN).map_err(|e| StewardError::Bootstrap(e.to_string()))?;
    if normalized.is_empty() || !pattern.is_match(&normalized) {
        return Err(StewardError::Bootstrap(format!(
            "invalid installer user id: {raw:?}"
        )));
    }
    Ok(normalized)
}

pub struct UserBootstrapper<'a> {
    normalizer: &'a dyn SchemaNormalizer,
}

impl<'a> UserBootstrapper<'a> {
    pub fn new(normalizer: &'a dyn SchemaNormalizer) -> Self {
        Self { normalizer }
    }

    pub fn bootstrap(
        &self,
        service: &ServiceDescriptor,
        identity: &str,
    ) -> Result<BootstrapReport, StewardError> {
        let user_id = normalize_user_id(identity)?;
        let env = read_env_values(&service.env_path())?;
        let library_root = configured_path(env.get("LIBRARY_PATH"), &service.library_path, service);
        let template_root = configured_path(
            env.get("LIBRARY_BASE_TEMPLATE_PATH"),
            &service.template_path,
            service,
        );
        if !template_root.is_dir() {
            return Err(StewardError::Bootstrap(format!(
                "library template root missing or invalid: {}",
                template_root.display()
            )));
        }

        let scoped_root = library_root.join("users").join(&user_id);
        fs::create_dir_all(&scoped_root)?;

        let mut changed: BTreeSet<String> = copy_template_idempotent(&template_root, &scoped_root)?
            .into_iter()
            .collect();
        changed.extend(self.normalizer.normalize(&scoped_root)?);

        info!(
            service = %service.key,
            user = %user_id,
            changed = changed.len(),
            "bootstrapped user library"
        );
        Ok(BootstrapReport {
            user_id,
            scoped_root,
            changed_paths: changed.into_iter().collect(),
        })
    }
}

fn configured_path(raw: Option<&String>, fallback: &Path, service: &ServiceDescriptor) -> PathBuf {
    match raw.map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(value) => {
            let path = PathBuf::from(expand_path(value));
            if path.is_absolute() {
                path
            } else {
                service.repo_path.join(path)
            }
        }
        None => fallback.to_path_buf(),
    }
}

/// Mirrors `source` into `destination` without replacing existing files.
/// Returns the relative paths of files actually copied, in walk order.
fn copy_template_idempotent(source: &Path, destination: &Path) -> Result<Vec<String>, StewardError> {
    let mut copied = Vec::new();
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| StewardError::Bootstrap(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| StewardError::Bootstrap(e.to_string()))?;
        let target = destination.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if !entry.path().is_file() || target.exists() {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        copied.push(posix(rel));
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{read_settings_from_str, ServiceSettings, DEFAULT_SERVICE_KEY};
    use crate::registry::ServiceRegistry;
    use tempfile::{tempdir, TempDir};

    fn service_with_template(dir: &TempDir) -> ServiceDescriptor {
        let service = ServiceDescriptor::from_settings(
            DEFAULT_SERVICE_KEY,
            &ServiceSettings::default(),
            dir.path(),
        );
        let template = &service.template_path;
        fs::create_dir_all(template.join("projects/active")).unwrap();
        fs::create_dir_all(template.join("empty")).unwrap();
        fs::write(template.join("README.md"), "template readme").unwrap();
        fs::write(template.join("projects/active/AGENT.md"), "agent").unwrap();
        service
    }

    #[test]
    fn user_id_validation() {
        assert_eq!(
            normalize_user_id("0b7e-44aa-9c1d").unwrap(),
            "0b7e44aa9c1d"
        );
        assert_eq!(normalize_user_id(" user_01 ").unwrap(), "user_01");
        assert!(normalize_user_id("ab").is_err());
        assert!(normalize_user_id("../etc").is_err());
        assert!(normalize_user_id("has space").is_err());
        assert!(normalize_user_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn bootstrap_copies_template_once() {
        let dir = tempdir().unwrap();
        let service = service_with_template(&dir);
        let bootstrapper = UserBootstrapper::new(&NoSchema);

        let first = bootstrapper.bootstrap(&service, "user_01").unwrap();
        assert_eq!(
            first.scoped_root,
            service.library_path.join("users").join("user_01")
        );
        assert_eq!(first.changed_paths, ["README.md", "projects/active/AGENT.md"]);
        assert!(first.scoped_root.join("empty").is_dir());

        let second = bootstrapper.bootstrap(&service, "user_01").unwrap();
        assert!(second.changed_paths.is_empty());
    }

    #[test]
    fn bootstrap_never_overwrites_existing_files() {
        let dir = tempdir().unwrap();
        let service = service_with_template(&dir);
        let scoped = service.library_path.join("users/user_01");
        fs::create_dir_all(&scoped).unwrap();
        fs::write(scoped.join("README.md"), "edited by user").unwrap();

        let schema = ScaffoldSchema {
            directories: vec!["projects/active".to_string(), "digest".to_string()],
            files: vec!["README.md".to_string(), "digest/index.md".to_string()],
        };
        let report = UserBootstrapper::new(&schema)
            .bootstrap(&service, "user_01")
            .unwrap();

        assert_eq!(
            fs::read_to_string(scoped.join("README.md")).unwrap(),
            "edited by user"
        );
        assert_eq!(
            report.changed_paths,
            ["digest", "digest/index.md", "projects/active/AGENT.md"]
        );
    }

    #[test]
    fn scaffold_schema_from_config_shapes_user_root() {
        let dir = tempdir().unwrap();
        let yaml = format!(
            "version: 1\nruntime_dir: '{}'\nservices:\n  {DEFAULT_SERVICE_KEY}:\n    schema:\n      kind: scaffold\n      directories: [digest, projects/archive]\n      files: [digest/index.md]\n",
            dir.path().display()
        );
        let settings = read_settings_from_str(&yaml).unwrap();
        let registry = ServiceRegistry::from_settings(&settings);
        let service = registry.get(DEFAULT_SERVICE_KEY).unwrap();
        assert_eq!(service.schema.kind, SchemaKind::Scaffold);
        fs::create_dir_all(&service.template_path).unwrap();
        fs::write(service.template_path.join("README.md"), "welcome").unwrap();

        let normalizer = normalizer_for(&service.schema);
        let report = UserBootstrapper::new(normalizer.as_ref())
            .bootstrap(service, "user_01")
            .unwrap();
        for expected in ["README.md", "digest", "digest/index.md", "projects/archive"] {
            assert!(
                report.changed_paths.iter().any(|p| p == expected),
                "missing {expected} in {:?}",
                report.changed_paths
            );
        }
        assert!(report.scoped_root.join("digest/index.md").is_file());
        assert!(report.scoped_root.join("projects/archive").is_dir());

        let again = UserBootstrapper::new(normalizer.as_ref())
            .bootstrap(service, "user_01")
            .unwrap();
        assert!(again.changed_paths.is_empty());
    }

    #[test]
    fn scaffold_schema_rejects_escaping_paths() {
        let schema = SchemaSettings {
            kind: SchemaKind::Scaffold,
            directories: vec!["../outside".to_string()],
            files: Vec::new(),
        };
        let dir = tempdir().unwrap();
        let err = normalizer_for(&schema)
            .normalize(dir.path())
            .expect_err("escaping path");
        assert_eq!(err.error_code(), "bootstrap_failed");
        assert!(!dir.path().join("../outside").exists());
    }

    #[test]
    fn bootstrap_follows_library_paths_from_env_file() {
        let dir = tempdir().unwrap();
        let service = service_with_template(&dir);
        let moved_template = dir.path().join("custom_template");
        fs::create_dir_all(&moved_template).unwrap();
        fs::write(moved_template.join("only.md"), "x").unwrap();
        fs::write(
            service.env_path(),
            format!(
                "LIBRARY_PATH=\"data/lib\"\nLIBRARY_BASE_TEMPLATE_PATH=\"{}\"\n",
                moved_template.display()
            ),
        )
        .unwrap();

        let report = UserBootstrapper::new(&NoSchema)
            .bootstrap(&service, "user_01")
            .unwrap();
        assert_eq!(
            report.scoped_root,
            service.repo_path.join("data/lib/users/user_01")
        );
        assert_eq!(report.changed_paths, ["only.md"]);
    }

    #[test]
    fn missing_template_root_fails() {
        let dir = tempdir().unwrap();
        let service = ServiceDescriptor::from_settings(
            DEFAULT_SERVICE_KEY,
            &ServiceSettings::default(),
            dir.path(),
        );
        let err = UserBootstrapper::new(&NoSchema)
            .bootstrap(&service, "user_01")
            .expect_err("no template");
        assert_eq!(err.error_code(), "bootstrap_failed");
    }

    #[test]
    fn scaffold_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let schema = ScaffoldSchema {
            directories: vec!["../outside".to_string()],
            files: Vec::new(),
        };
        assert!(schema.normalize(dir.path()).is_err());
        assert!(!dir.path().parent().unwrap().join("outside").exists());
    }
}
