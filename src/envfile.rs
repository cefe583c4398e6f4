//! `.env` rendering for managed services.
//!
//! Managed keys are rewritten to their computed values on every call. Any other
//! line in the file, comments and unknown keys included, is kept byte-for-byte
//! and in place.

use crate::error::StewardError;
use crate::registry::ServiceDescriptor;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EnvWrite {
    pub changed: bool,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub managed_keys: Vec<String>,
}

pub struct EnvFileMaterializer;

impl EnvFileMaterializer {
    /// Brings `<repo>/.env` in line with the service defaults plus `overrides`.
    ///
    /// `managed_keys` narrows which keys get rewritten; by default every key in the
    /// merged value map is managed. Nothing is written when the rendered content is
    /// identical to what is on disk.
    pub fn materialize(
        service: &ServiceDescriptor,
        overrides: &BTreeMap<String, String>,
        managed_keys: Option<&[String]>,
        backup: bool,
    ) -> Result<EnvWrite, StewardError> {
        if !service.repo_path.is_dir() {
            return Err(StewardError::SourceMissing(service.repo_path.clone()));
        }
        let env_path = service.env_path();
        let existed = env_path.exists();
        if !existed {
            seed_env_file(service, &env_path)?;
        }

        let mut values = service.default_env_values();
        for (key, value) in overrides {
            values.insert(key.clone(), value.clone());
        }
        let managed: Vec<String> = match managed_keys {
            Some(keys) if !keys.is_empty() => keys.to_vec(),
            _ => values.keys().cloned().collect(),
        };

        let existing = fs::read_to_string(&env_path)?;
        let rendered = render_env_content(&existing, &values, &managed);
        if rendered == existing {
            debug!(path = %env_path.display(), "env file already current");
            return Ok(EnvWrite {
                changed: false,
                path: env_path,
                backup_path: None,
                managed_keys: managed,
            });
        }

        let backup_path = if backup && existed {
            let path = backup_path_for(&env_path);
            fs::write(&path, &existing)?;
            Some(path)
        } else {
            None
        };
        write_atomic_text_file_preserving_mode(&env_path, &rendered, 0o600)?;
        info!(
            service = %service.key,
            path = %env_path.display(),
            backup = backup_path.is_some(),
            "materialized env file"
        );
        Ok(EnvWrite {
            changed: true,
            path: env_path,
            backup_path,
            managed_keys: managed,
        })
    }
}

/// Copies the first template candidate that exists, or creates an empty file.
fn seed_env_file(service: &ServiceDescriptor, env_path: &Path) -> Result<(), StewardError> {
    match service
        .template_candidates()
        .into_iter()
        .find(|candidate| candidate.is_file())
    {
        Some(template) => {
            debug!(template = %template.display(), "seeding env file from template");
            fs::copy(&template, env_path)?;
        }
        None => fs::write(env_path, "")?,
    }
    Ok(())
}

fn backup_path_for(env_path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let name = env_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| ".env".to_string());
    let mut candidate = env_path.with_file_name(format!("{name}.bak.{stamp}"));
    let mut suffix = 1;
    while candidate.exists() {
        candidate = env_path.with_file_name(format!("{name}.bak.{stamp}.{suffix}"));
        suffix += 1;
    }
    candidate
}

/// JSON string encoding, which dotenv loaders read back as the same value.
pub fn quote_env_value(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

fn unquote_env_value(raw: &str) -> String {
    let value = raw.trim();
    if value.len() >= 2 {
        if value.starts_with('"') && value.ends_with('"') {
            return serde_json::from_str::<String>(value)
                .unwrap_or_else(|_| value[1..value.len() - 1].to_string());
        }
        if value.starts_with('\'') && value.ends_with('\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// Splits an assignment line into its `export ` prefix (if any), key, and raw value.
fn split_assignment(line: &str) -> Option<(bool, &str, &str)> {
    let stripped = line.trim();
    if stripped.is_empty() || stripped.starts_with('#') {
        return None;
    }
    let (exported, body) = match stripped.strip_prefix("export ") {
        Some(rest) => (true, rest.trim_start()),
        None => (false, stripped),
    };
    let (key, value) = body.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((exported, key, value))
}

/// Ordered key/value pairs from `.env` text; later duplicates win.
pub fn parse_env_lines(text: &str) -> Vec<(String, String)> {
    let mut values: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let Some((_, key, raw)) = split_assignment(line) else {
            continue;
        };
        let value = unquote_env_value(raw);
        match values.iter_mut().find(|(existing, _)| existing == key) {
            Some(entry) => entry.1 = value,
            None => values.push((key.to_string(), value)),
        }
    }
    values
}

pub fn render_env_content(
    existing: &str,
    values: &BTreeMap<String, String>,
    managed_keys: &[String],
) -> String {
    let managed: HashSet<&str> = managed_keys
        .iter()
        .map(String::as_str)
        .filter(|key| !key.is_empty())
        .collect();
    let value_for = |key: &str| quote_env_value(values.get(key).map(String::as_str).unwrap_or(""));
    let mut seen: HashSet<String> = HashSet::new();
    let mut lines: Vec<String> = Vec::new();

    for line in existing.lines() {
        match split_assignment(line) {
            Some((exported, key, _)) if managed.contains(key) => {
                let prefix = if exported { "export " } else { "" };
                lines.push(format!("{prefix}{key}={}", value_for(key)));
                seen.insert(key.to_string());
            }
            _ => lines.push(line.to_string()),
        }
    }
    for key in managed_keys {
        if key.is_empty() || seen.contains(key) {
            continue;
        }
        lines.push(format!("{key}={}", value_for(key)));
        seen.insert(key.clone());
    }

    let mut rendered = lines.join("\n").trim_end().to_string();
    rendered.push('\n');
    rendered
}

pub fn read_env_values(path: &Path) -> Result<BTreeMap<String, String>, StewardError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let text = fs::read_to_string(path)?;
    Ok(parse_env_lines(&text).into_iter().collect())
}

/// Keys declared by any template candidate, followed by the managed defaults.
pub fn required_env_keys(service: &ServiceDescriptor) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for candidate in service.template_candidates() {
        let Ok(text) = fs::read_to_string(&candidate) else {
            continue;
        };
        keys.extend(parse_env_lines(&text).into_iter().map(|(key, _)| key));
    }
    keys.extend(service.default_env_values().into_keys());

    let mut seen = HashSet::new();
    keys.retain(|key| seen.insert(key.clone()));
    keys
}

fn write_atomic_text_file_preserving_mode(
    path: &Path,
    content: &str,
    default_mode: u32,
) -> Result<(), StewardError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "env".to_string()),
        std::process::id(),
        ts
    ));
    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(default_mode);
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = default_mode;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
