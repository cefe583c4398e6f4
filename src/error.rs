use crate::command::StepRecord;
use crate::config::DirtyPolicy;
use crate::health::PollReport;
use serde::Serialize;
use serde_json::json;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Which part of source acquisition failed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Source,
    Clone,
    Copy,
    NotGitRepo,
    Status,
    Stash,
    Fetch,
    Pull,
}

impl SyncStage {
    pub fn error_code(self) -> &'static str {
        match self {
            SyncStage::Source => "source_invalid",
            SyncStage::Clone => "clone_failed",
            SyncStage::Copy => "copy_failed",
            SyncStage::NotGitRepo => "not_git_repo",
            SyncStage::Status => "status_failed",
            SyncStage::Stash => "stash_failed",
            SyncStage::Fetch => "fetch_failed",
            SyncStage::Pull => "pull_failed",
        }
    }
}

/// Last failing stage of an environment build attempt.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    CreateVenv,
    Install,
    Verify,
}

impl BuildStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStage::CreateVenv => "create_venv",
            BuildStage::Install => "install",
            BuildStage::Verify => "verify",
        }
    }
}

#[derive(Debug, Error)]
pub enum StewardError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unknown service key: {0}")]
    UnknownService(String),
    #[error("{tool} executable not found in PATH")]
    ToolingUnavailable { tool: String },
    #[error("{message}")]
    Acquisition {
        stage: SyncStage,
        message: String,
        steps: Vec<StepRecord>,
    },
    #[error("worktree at {} has local changes and dirty policy is '{policy}'", path.display())]
    DirtyWorktree {
        path: PathBuf,
        policy: DirtyPolicy,
        steps: Vec<StepRecord>,
    },
    #[error("runtime dependencies could not be installed (last failure: {}); see step outputs for the failing command", reason.as_str())]
    EnvironmentBuild {
        reason: BuildStage,
        steps: Vec<StepRecord>,
    },
    #[error("start script failed: {}", step.stderr.trim())]
    ProcessStart { step: StepRecord },
    #[error("service failed health check after startup ({} attempts)", poll.attempt)]
    HealthTimeout {
        start: StepRecord,
        poll: PollReport,
        log_tail: String,
    },
    #[error("script `{}` failed with status {:?}", step.command, step.code)]
    ScriptFailed { step: StepRecord },
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("service source tree missing at {}", .0.display())]
    SourceMissing(PathBuf),
    #[error("runtime lock unavailable at {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{step} failed: {source}")]
    Workflow {
        step: String,
        steps: Vec<StepRecord>,
        #[source]
        source: Box<StewardError>,
    },
    #[error("background task failed: {0}")]
    Join(String),
}

/// Machine-readable view of a failure, emitted alongside the message in JSON output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl StewardError {
    pub fn error_code(&self) -> String {
        match self {
            StewardError::Config(_) => "config_invalid".to_string(),
            StewardError::Io(_) => "io_error".to_string(),
            StewardError::Yaml(_) => "config_invalid".to_string(),
            StewardError::Json(_) => "json_error".to_string(),
            StewardError::Http(_) => "http_error".to_string(),
            StewardError::UnknownService(_) => "unknown_service".to_string(),
            StewardError::ToolingUnavailable { tool } => format!("{tool}_not_found"),
            StewardError::Acquisition { stage, .. } => stage.error_code().to_string(),
            StewardError::DirtyWorktree { .. } => "dirty_worktree".to_string(),
            StewardError::EnvironmentBuild { reason, .. } => reason.as_str().to_string(),
            StewardError::ProcessStart { .. } => "start_failed".to_string(),
            StewardError::HealthTimeout { .. } => "health_timeout".to_string(),
            StewardError::ScriptFailed { step } => format!("{}_failed", step.step),
            StewardError::Bootstrap(_) => "bootstrap_failed".to_string(),
            StewardError::SourceMissing(_) => "source_missing".to_string(),
            StewardError::Lock { .. } => "lock_unavailable".to_string(),
            StewardError::Workflow { source, .. } => source.error_code(),
            StewardError::Join(_) => "task_failed".to_string(),
        }
    }

    /// Name of the workflow step that failed, when the failure belongs to one.
    pub fn failed_step(&self) -> Option<String> {
        match self {
            StewardError::Acquisition { .. } | StewardError::DirtyWorktree { .. } => {
                Some("sync_source".to_string())
            }
            StewardError::EnvironmentBuild { reason, .. } => Some(reason.as_str().to_string()),
            StewardError::ProcessStart { .. } => Some("start".to_string()),
            StewardError::HealthTimeout { .. } => Some("health".to_string()),
            StewardError::ScriptFailed { step } => Some(step.step.clone()),
            StewardError::Bootstrap(_) => Some("bootstrap_user".to_string()),
            StewardError::Workflow { step, .. } => Some(step.clone()),
            _ => None,
        }
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        match self {
            StewardError::Acquisition { steps, .. }
            | StewardError::DirtyWorktree { steps, .. }
            | StewardError::EnvironmentBuild { steps, .. } => steps.clone(),
            StewardError::ProcessStart { step } | StewardError::ScriptFailed { step } => {
                vec![step.clone()]
            }
            StewardError::HealthTimeout { start, .. } => vec![start.clone()],
            StewardError::Workflow { steps, source, .. } => {
                let mut all = steps.clone();
                all.extend(source.steps());
                all
            }
            _ => Vec::new(),
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            StewardError::ToolingUnavailable { tool } => {
                Some(format!("Install {tool} and ensure it is on your PATH."))
            }
            StewardError::DirtyWorktree { .. } => Some(
                "Commit or discard local changes, or set STEWARD_DIRTY_POLICY=stash|skip."
                    .to_string(),
            ),
            StewardError::Acquisition {
                stage: SyncStage::Pull,
                ..
            } => Some(
                "Local history diverged from upstream; fast-forward is impossible. Reconcile the checkout manually."
                    .to_string(),
            ),
            StewardError::HealthTimeout { .. } => {
                Some("Inspect log_tail for the service's own startup errors.".to_string())
            }
            StewardError::Workflow { source, .. } => source.hint(),
            _ => None,
        }
    }

    fn context(&self) -> Option<serde_json::Value> {
        match self {
            StewardError::HealthTimeout { poll, log_tail, .. } => {
                Some(json!({"health": poll, "log_tail": log_tail}))
            }
            StewardError::DirtyWorktree { path, policy, .. } => {
                Some(json!({"path": path, "dirty_worktree_policy": policy}))
            }
            StewardError::SourceMissing(path) => Some(json!({"path": path})),
            StewardError::Lock { path, .. } => Some(json!({"lock_file": path})),
            StewardError::Workflow { source, .. } => source.context(),
            _ => None,
        }
    }

    pub fn details(&self) -> ErrorDetails {
        ErrorDetails {
            error_code: self.error_code(),
            step: self.failed_step(),
            hint: self.hint(),
            steps: self.steps(),
            context: self.context(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_step(name: &str) -> StepRecord {
        StepRecord::missing(name, "python3 init_db.py", "boom".to_string())
    }

    #[test]
    fn workflow_error_delegates_code_and_collects_steps() {
        let inner = StewardError::ScriptFailed {
            step: failed_step("init_db"),
        };
        let err = StewardError::Workflow {
            step: "init_db".to_string(),
            steps: vec![failed_step("create_venv")],
            source: Box::new(inner),
        };
        let details = err.details();
        assert_eq!(details.error_code, "init_db_failed");
        assert_eq!(details.step.as_deref(), Some("init_db"));
        assert_eq!(details.steps.len(), 2);
        assert_eq!(details.steps[0].step, "create_venv");
    }

    #[test]
    fn tooling_unavailable_has_distinct_code_and_hint() {
        let err = StewardError::ToolingUnavailable {
            tool: "git".to_string(),
        };
        let details = err.details();
        assert_eq!(details.error_code, "git_not_found");
        assert!(details.hint.unwrap().contains("git"));
    }

    #[test]
    fn acquisition_stages_map_to_distinct_codes() {
        let stages = [
            SyncStage::Clone,
            SyncStage::Copy,
            SyncStage::Status,
            SyncStage::Stash,
            SyncStage::Fetch,
            SyncStage::Pull,
        ];
        let mut codes: Vec<_> = stages.iter().map(|s| s.error_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), stages.len());
    }
}
