use crate::error::StewardError;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub const INSTALL_JOB_TYPE: &str = "service.install";

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Payload handed to the host's job queue for a background install.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstallJob {
    pub service_keys: Vec<String>,
    pub full_install: bool,
    pub force_recreate: bool,
    pub auto_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer_user_id: Option<String>,
    pub require_user_bootstrap: bool,
}

pub trait JobQueue: Send + Sync {
    fn enqueue(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<String, StewardError>;
}

/// `install_<user>_<version>_<unique>`; never reused within or across processes.
pub fn idempotency_key(user: Option<&str>, version: &str) -> String {
    let user = user.filter(|u| !u.trim().is_empty()).unwrap_or("anonymous");
    let seq = JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "install_{}_{}_{}-{}-{}",
        user.trim(),
        version,
        Utc::now().format("%Y%m%d%H%M%S%f"),
        std::process::id(),
        seq
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_and_prefixed() {
        let a = idempotency_key(Some("user_01"), "0.4.0");
        let b = idempotency_key(Some("user_01"), "0.4.0");
        assert_ne!(a, b);
        assert!(a.starts_with("install_user_01_0.4.0_"));
        assert!(idempotency_key(None, "1").starts_with("install_anonymous_1_"));
    }

    #[test]
    fn payload_serializes_expected_fields() {
        let job = InstallJob {
            service_keys: vec!["library_service".to_string()],
            full_install: true,
            force_recreate: false,
            auto_start: true,
            installer_user_id: Some("user_01".to_string()),
            require_user_bootstrap: true,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["service_keys"][0], "library_service");
        assert_eq!(value["installer_user_id"], "user_01");
        assert_eq!(value["require_user_bootstrap"], true);
    }
}
