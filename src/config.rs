//! Settings file plus the environment overrides applied on top of it.

use crate::error::StewardError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_ENV: &str = "STEWARD_CONFIG";
pub const CONFIG_DIR_ENV: &str = "STEWARD_CONFIG_DIR";
pub const RUNTIME_DIR_ENV: &str = "STEWARD_RUNTIME_DIR";
pub const SERVICE_SOURCE_ENV: &str = "STEWARD_SERVICE_SOURCE";
pub const DIRTY_POLICY_ENV: &str = "STEWARD_DIRTY_POLICY";

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_SERVICE_KEY: &str = "library_service";
pub const DEFAULT_SOURCE_URL: &str = "https://github.com/DJJones66/Library-Service";

/// What to do when an update finds uncommitted changes in the checkout.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DirtyPolicy {
    #[default]
    Stash,
    Skip,
    Fail,
}

impl DirtyPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DirtyPolicy::Stash => "stash",
            DirtyPolicy::Skip => "skip",
            DirtyPolicy::Fail => "fail",
        }
    }

    /// Lenient parse used for the environment override: unknown values mean the default.
    pub fn from_env_value(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }
}

impl fmt::Display for DirtyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirtyPolicy {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stash" => Ok(DirtyPolicy::Stash),
            "skip" => Ok(DirtyPolicy::Skip),
            "fail" => Ok(DirtyPolicy::Fail),
            other => Err(StewardError::Config(format!(
                "unknown dirty worktree policy '{other}' (expected stash, skip or fail)"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub version: u32,
    /// Root under which every managed service's source tree lives. Empty means the platform default.
    pub runtime_dir: String,
    pub dirty_policy: DirtyPolicy,
    pub install_attempts: u32,
    pub command_timeout_sec: u64,
    pub git_timeout_sec: u64,
    pub output_limit: usize,
    pub log_tail_lines: usize,
    pub health: HealthSettings,
    pub services: BTreeMap<String, ServiceSettings>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSettings {
    pub attempts: u32,
    pub delay_ms: u64,
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSettings {
    pub label: String,
    pub dir_name: String,
    /// Remote URL or local directory. Empty falls back to `seed_paths`, then the default URL.
    pub source: String,
    pub seed_paths: Vec<String>,
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub scripts_dir: String,
    pub environment_dir: String,
    pub log_file: String,
    /// Interpreter used for the delegated scripts. Empty means python3/python from PATH.
    pub interpreter: String,
    pub runtime_packages: Vec<String>,
    pub import_check: String,
    pub library_dir: String,
    pub template_dir: String,
    pub require_user_header: bool,
    pub scripts: ScriptNames,
    pub schema: SchemaSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptNames {
    pub create_env: String,
    pub install: String,
    pub init: String,
    pub start: String,
    pub stop: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    #[default]
    None,
    Scaffold,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SchemaSettings {
    pub kind: SchemaKind,
    pub directories: Vec<String>,
    pub files: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut services = BTreeMap::new();
        services.insert(DEFAULT_SERVICE_KEY.to_string(), ServiceSettings::default());
        Self {
            version: CONFIG_VERSION,
            runtime_dir: String::new(),
            dirty_policy: DirtyPolicy::Stash,
            install_attempts: 2,
            command_timeout_sec: 600,
            git_timeout_sec: 900,
            output_limit: crate::command::DEFAULT_OUTPUT_LIMIT,
            log_tail_lines: 120,
            health: HealthSettings::default(),
            services,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay_ms: 500,
            timeout_sec: 3,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            label: "Library Service".to_string(),
            dir_name: "Library-Service".to_string(),
            source: String::new(),
            seed_paths: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: 18170,
            health_path: "/health".to_string(),
            scripts_dir: "service_scripts".to_string(),
            environment_dir: ".venv".to_string(),
            log_file: "service_runtime.log".to_string(),
            interpreter: String::new(),
            runtime_packages: vec![
                "fastapi".to_string(),
                "uvicorn".to_string(),
                "dulwich".to_string(),
                "httpx".to_string(),
            ],
            import_check: String::new(),
            library_dir: "library".to_string(),
            template_dir: "library_templates/Base_Library".to_string(),
            require_user_header: true,
            scripts: ScriptNames::default(),
            schema: SchemaSettings::default(),
        }
    }
}

impl Default for ScriptNames {
    fn default() -> Self {
        Self {
            create_env: "create_venv.py".to_string(),
            install: "install_with_venv.py".to_string(),
            init: "init_db.py".to_string(),
            start: "start_with_venv.py".to_string(),
            stop: "shutdown_with_venv.py".to_string(),
        }
    }
}

impl ServiceSettings {
    /// Python statement importing every runtime package; `import_check` wins when set.
    pub fn effective_import_check(&self) -> String {
        if !self.import_check.trim().is_empty() {
            return self.import_check.trim().to_string();
        }
        let modules: Vec<&str> = self
            .runtime_packages
            .iter()
            .map(|pkg| pkg.trim())
            .filter(|pkg| !pkg.is_empty())
            .collect();
        format!("import {}", modules.join(", "))
    }
}

impl Settings {
    /// Reads `path` when it exists (defaults otherwise), then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self, StewardError> {
        let mut settings = if path.exists() {
            read_settings(path)?
        } else {
            Settings::default()
        };
        settings.apply_overrides(|key| env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(RUNTIME_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.runtime_dir = dir.trim().to_string();
        }
        if let Some(source) = lookup(SERVICE_SOURCE_ENV).filter(|v| !v.trim().is_empty()) {
            for service in self.services.values_mut() {
                service.source = source.trim().to_string();
            }
        }
        if let Some(policy) = lookup(DIRTY_POLICY_ENV) {
            self.dirty_policy = DirtyPolicy::from_env_value(&policy);
        }
    }

    pub fn validate(&self) -> Result<(), StewardError> {
        if self.version != CONFIG_VERSION {
            return Err(StewardError::Config(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        if self.install_attempts == 0 {
            return Err(StewardError::Config(
                "install_attempts must be greater than 0".to_string(),
            ));
        }
        if self.health.attempts == 0 {
            return Err(StewardError::Config(
                "health.attempts must be greater than 0".to_string(),
            ));
        }
        if self.services.is_empty() {
            return Err(StewardError::Config(
                "services must contain at least one service".to_string(),
            ));
        }
        for (key, service) in &self.services {
            if key.trim().is_empty() {
                return Err(StewardError::Config(
                    "service keys must be non-empty".to_string(),
                ));
            }
            if service.dir_name.trim().is_empty() || service.dir_name.contains(['/', '\\']) {
                return Err(StewardError::Config(format!(
                    "services.{key}.dir_name must be a single non-empty path component"
                )));
            }
            if service.port == 0 {
                return Err(StewardError::Config(format!(
                    "services.{key}.port must be greater than 0"
                )));
            }
            if service.runtime_packages.is_empty() && service.import_check.trim().is_empty() {
                return Err(StewardError::Config(format!(
                    "services.{key} needs runtime_packages or import_check"
                )));
            }
        }
        Ok(())
    }

    pub fn resolved_runtime_dir(&self) -> PathBuf {
        let configured = self.runtime_dir.trim();
        let path = if configured.is_empty() {
            dirs::data_local_dir()
                .map(|base| base.join("steward").join("services_runtime"))
                .unwrap_or_else(|| PathBuf::from("services_runtime"))
        } else {
            PathBuf::from(expand_path(configured))
        };
        absolutize(&path)
    }
}

pub fn read_settings_from_str(content: &str) -> Result<Settings, StewardError> {
    let settings: Settings = serde_yaml::from_str(content)?;
    settings.validate()?;
    Ok(settings)
}

pub fn read_settings(path: &Path) -> Result<Settings, StewardError> {
    let content = fs::read_to_string(path)?;
    read_settings_from_str(&content)
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .map(|base| base.join("steward"))
        .unwrap_or_else(|| PathBuf::from(".steward"))
}

pub fn expand_path(input: &str) -> String {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_apply() {
        let settings = read_settings_from_str("version: 1").expect("settings");
        assert_eq!(settings.install_attempts, 2);
        assert_eq!(settings.health.attempts, 20);
        assert_eq!(settings.health.delay_ms, 500);
        assert_eq!(settings.dirty_policy, DirtyPolicy::Stash);
        let service = &settings.services[DEFAULT_SERVICE_KEY];
        assert_eq!(service.port, 18170);
        assert_eq!(service.dir_name, "Library-Service");
        assert_eq!(
            service.effective_import_check(),
            "import fastapi, uvicorn, dulwich, httpx"
        );
    }

    #[test]
    fn unknown_field_errors() {
        let yaml = "version: 1\nunknown: true\n";
        assert!(read_settings_from_str(yaml).is_err());
    }

    #[test]
    fn unsupported_version_errors() {
        let err = read_settings_from_str("version: 7").expect_err("version 7 should fail");
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn service_entries_fill_missing_fields_from_defaults() {
        let yaml = r#"
version: 1
services:
  notes:
    label: Notes
    dir_name: Notes-Service
    port: 9000
"#;
        let settings = read_settings_from_str(yaml).expect("settings");
        assert_eq!(settings.services.len(), 1);
        let notes = &settings.services["notes"];
        assert_eq!(notes.port, 9000);
        assert_eq!(notes.scripts.start, "start_with_venv.py");
        assert_eq!(notes.health_path, "/health");
    }

    #[test]
    fn rejects_nested_dir_name() {
        let yaml = "version: 1\nservices:\n  svc:\n    dir_name: a/b\n";
        let err = read_settings_from_str(yaml).expect_err("nested dir should fail");
        assert!(err.to_string().contains("dir_name"));
    }

    #[test]
    fn env_overrides_replace_runtime_dir_source_and_policy() {
        let mut settings = Settings::default();
        settings.apply_overrides(|key| match key {
            RUNTIME_DIR_ENV => Some("/srv/runtime".to_string()),
            SERVICE_SOURCE_ENV => Some("git@example.com:org/svc.git".to_string()),
            DIRTY_POLICY_ENV => Some("FAIL".to_string()),
            _ => None,
        });
        assert_eq!(settings.runtime_dir, "/srv/runtime");
        assert_eq!(settings.dirty_policy, DirtyPolicy::Fail);
        assert_eq!(
            settings.services[DEFAULT_SERVICE_KEY].source,
            "git@example.com:org/svc.git"
        );
    }

    #[test]
    fn unknown_dirty_policy_falls_back_to_stash() {
        let mut settings = Settings {
            dirty_policy: DirtyPolicy::Fail,
            ..Settings::default()
        };
        settings.apply_overrides(|key| (key == DIRTY_POLICY_ENV).then(|| "merge".to_string()));
        assert_eq!(settings.dirty_policy, DirtyPolicy::Stash);
    }

    #[test]
    fn strict_policy_parse_rejects_unknown_values() {
        assert_eq!("skip".parse::<DirtyPolicy>().unwrap(), DirtyPolicy::Skip);
        assert!("merge".parse::<DirtyPolicy>().is_err());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.yaml")).expect("defaults");
        assert!(settings.services.contains_key(DEFAULT_SERVICE_KEY));
    }

    #[test]
    fn expand_tilde_works() {
        let expanded = expand_path("~/steward-runtime");
        assert!(!expanded.starts_with("~/"));
    }

    #[test]
    fn resolved_runtime_dir_is_absolute() {
        let settings = Settings {
            runtime_dir: "relative/runtime".to_string(),
            ..Settings::default()
        };
        assert!(settings.resolved_runtime_dir().is_absolute());
    }
}
