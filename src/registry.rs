use crate::config::{
    expand_path, SchemaSettings, ScriptNames, ServiceSettings, Settings, DEFAULT_SOURCE_URL,
};
use crate::error::StewardError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Template file names tried, in order, when a service has no `.env` yet.
pub const ENV_TEMPLATE_CANDIDATES: [&str; 4] =
    [".env-example", ".env.example", ".env.local.example", ".env.local"];

pub const ENV_FILE_NAME: &str = ".env";

/// Resolved, immutable view of one managed service.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceDescriptor {
    pub key: String,
    pub label: String,
    pub source_location: String,
    pub runtime_dir: PathBuf,
    pub repo_path: PathBuf,
    pub environment_path: PathBuf,
    pub health_url: String,
    pub host: String,
    pub port: u16,
    pub scripts_dir: PathBuf,
    pub log_path: PathBuf,
    pub interpreter: PathBuf,
    pub runtime_packages: Vec<String>,
    pub import_check: String,
    pub library_path: PathBuf,
    pub template_path: PathBuf,
    pub require_user_header: bool,
    #[serde(skip)]
    pub scripts: ScriptNames,
    #[serde(skip)]
    pub schema: SchemaSettings,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceMetadata {
    pub key: String,
    pub label: String,
    pub health_url: String,
    pub repo_path: PathBuf,
    pub source_location: String,
}

impl ServiceDescriptor {
    pub fn from_settings(key: &str, service: &ServiceSettings, runtime_dir: &Path) -> Self {
        let repo_path = runtime_dir.join(&service.dir_name);
        let health_path = if service.health_path.starts_with('/') {
            service.health_path.clone()
        } else {
            format!("/{}", service.health_path)
        };
        Self {
            key: key.to_string(),
            label: service.label.clone(),
            source_location: resolve_source(service),
            runtime_dir: runtime_dir.to_path_buf(),
            environment_path: repo_path.join(&service.environment_dir),
            health_url: format!("http://{}:{}{}", service.host, service.port, health_path),
            host: service.host.clone(),
            port: service.port,
            scripts_dir: repo_path.join(&service.scripts_dir),
            log_path: repo_path.join(&service.log_file),
            interpreter: resolve_interpreter(&service.interpreter),
            runtime_packages: service.runtime_packages.clone(),
            import_check: service.effective_import_check(),
            library_path: repo_path.join(&service.library_dir),
            template_path: repo_path.join(&service.template_dir),
            require_user_header: service.require_user_header,
            scripts: service.scripts.clone(),
            schema: service.schema.clone(),
            repo_path,
        }
    }

    /// `<runtime_dir>/.<key>-runtime.lock`, with underscores turned into dashes.
    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir
            .join(format!(".{}-runtime.lock", self.key.replace('_', "-")))
    }

    pub fn env_path(&self) -> PathBuf {
        self.repo_path.join(ENV_FILE_NAME)
    }

    pub fn script(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(name)
    }

    pub fn template_candidates(&self) -> Vec<PathBuf> {
        ENV_TEMPLATE_CANDIDATES
            .iter()
            .map(|name| self.repo_path.join(name))
            .collect()
    }

    pub fn environment_python(&self) -> PathBuf {
        if cfg!(windows) {
            self.environment_path.join("Scripts").join("python.exe")
        } else {
            self.environment_path.join("bin").join("python")
        }
    }

    pub fn default_env_values(&self) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        values.insert("PROCESS_HOST".to_string(), self.host.clone());
        values.insert("PROCESS_PORT".to_string(), self.port.to_string());
        values.insert(
            "STEWARD_SERVICES_RUNTIME_DIR".to_string(),
            self.runtime_dir.to_string_lossy().to_string(),
        );
        values.insert(
            "LIBRARY_PATH".to_string(),
            self.library_path.to_string_lossy().to_string(),
        );
        values.insert(
            "LIBRARY_BASE_TEMPLATE_PATH".to_string(),
            self.template_path.to_string_lossy().to_string(),
        );
        values.insert(
            "LIBRARY_REQUIRE_USER_HEADER".to_string(),
            if self.require_user_header { "true" } else { "false" }.to_string(),
        );
        values
    }

    pub fn metadata(&self) -> ServiceMetadata {
        ServiceMetadata {
            key: self.key.clone(),
            label: self.label.clone(),
            health_url: self.health_url.clone(),
            repo_path: self.repo_path.clone(),
            source_location: self.source_location.clone(),
        }
    }
}

/// Explicit source first, then the first seed directory that exists, then the public repository.
fn resolve_source(service: &ServiceSettings) -> String {
    let configured = service.source.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    service
        .seed_paths
        .iter()
        .map(|raw| expand_path(raw.trim()))
        .find(|candidate| !candidate.is_empty() && Path::new(candidate).is_dir())
        .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string())
}

fn resolve_interpreter(configured: &str) -> PathBuf {
    let configured = configured.trim();
    if !configured.is_empty() {
        return PathBuf::from(expand_path(configured));
    }
    which::which("python3")
        .or_else(|_| which::which("python"))
        .unwrap_or_else(|_| PathBuf::from("python3"))
}

/// Catalog of every configured service, built once at startup and passed around explicitly.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn from_settings(settings: &Settings) -> Self {
        let runtime_dir = settings.resolved_runtime_dir();
        let services = settings
            .services
            .iter()
            .map(|(key, service)| {
                (
                    key.clone(),
                    ServiceDescriptor::from_settings(key, service, &runtime_dir),
                )
            })
            .collect();
        Self { services }
    }

    pub fn get(&self, key: &str) -> Result<&ServiceDescriptor, StewardError> {
        self.services
            .get(key.trim())
            .ok_or_else(|| StewardError::UnknownService(key.to_string()))
    }

    pub fn metadata(&self) -> Vec<ServiceMetadata> {
        self.services.values().map(ServiceDescriptor::metadata).collect()
    }
}
