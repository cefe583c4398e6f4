use crate::command::{run_script, CommandRunner, ScriptCall, StepRecord, DEFAULT_OUTPUT_LIMIT};
use crate::error::StewardError;
use crate::registry::ServiceDescriptor;
use serde::Serialize;
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StopReport {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<StepRecord>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PrecheckReport {
    pub success: bool,
    pub service: String,
    pub missing: Vec<String>,
}

/// Starts and stops a service through the scripts its own tree provides.
pub struct ProcessController<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Option<Duration>,
    output_limit: usize,
}

impl<'a> ProcessController<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            timeout: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_limits(mut self, output_limit: usize, timeout: Option<Duration>) -> Self {
        self.output_limit = output_limit;
        self.timeout = timeout;
        self
    }

    fn script(&self, service: &ServiceDescriptor, step: &str, name: &str) -> StepRecord {
        let script = service.script(name);
        let env = service.default_env_values();
        run_script(
            self.runner,
            step,
            &ScriptCall {
                interpreter: &service.interpreter,
                script: &script,
                cwd: &service.repo_path,
                env: &env,
                timeout: self.timeout,
                limit: self.output_limit,
            },
        )
    }

    pub fn start_script(&self, service: &ServiceDescriptor) -> Result<StepRecord, StewardError> {
        info!(service = %service.key, "starting service");
        let step = self.script(service, "start", &service.scripts.start);
        if !step.success {
            warn!(service = %service.key, code = ?step.code, "start script failed");
            return Err(StewardError::ProcessStart { step });
        }
        Ok(step)
    }

    /// Nothing to stop when the source tree is absent.
    pub fn stop(&self, service: &ServiceDescriptor) -> Result<StopReport, StewardError> {
        if !service.repo_path.exists() {
            info!(service = %service.key, "source tree missing; nothing to stop");
            return Ok(StopReport {
                skipped: true,
                reason: Some("repo_missing".to_string()),
                step: None,
            });
        }
        info!(service = %service.key, "stopping service");
        let step = self.script(service, "stop", &service.scripts.stop);
        if !step.success {
            return Err(StewardError::ScriptFailed { step });
        }
        Ok(StopReport {
            skipped: false,
            reason: None,
            step: Some(step),
        })
    }

    pub fn precheck(&self, service: &ServiceDescriptor) -> PrecheckReport {
        let mut missing = Vec::new();
        if !service.repo_path.exists() {
            missing.push("repo".to_string());
        }
        if !service.scripts_dir.exists() {
            missing.push("service_scripts".to_string());
        }
        if !service.environment_python().exists() {
            missing.push("environment_interpreter".to_string());
        }
        PrecheckReport {
            success: missing.is_empty(),
            service: service.key.clone(),
            missing,
        }
    }
}

/// Last `lines` lines of the service's own log; empty when unreadable.
pub fn tail_log(service: &ServiceDescriptor, lines: usize) -> String {
    let Ok(bytes) = fs::read(&service.log_path) else {
        return String::new();
    };
    let content = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::command::CommandOutput;
    use crate::config::{ServiceSettings, DEFAULT_SERVICE_KEY};
    use tempfile::{tempdir, TempDir};

    fn service_in(dir: &TempDir) -> ServiceDescriptor {
        ServiceDescriptor::from_settings(DEFAULT_SERVICE_KEY, &ServiceSettings::default(), dir.path())
    }

    fn with_scripts(service: &ServiceDescriptor) {
        fs::create_dir_all(&service.scripts_dir).unwrap();
        fs::write(service.script(&service.scripts.start), "").unwrap();
        fs::write(service.script(&service.scripts.stop), "").unwrap();
    }

    #[test]
    fn stop_without_source_tree_is_skipped() {
        let dir = tempdir().unwrap();
        let service = service_in(&dir);
        let runner = ScriptedRunner::succeeding();
        let report = ProcessController::new(&runner).stop(&service).unwrap();
        assert!(report.skipped);
        assert_eq!(report.reason.as_deref(), Some("repo_missing"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn stop_runs_script_in_repo_with_service_env() {
        let dir = tempdir().unwrap();
        let service = service_in(&dir);
        with_scripts(&service);
        let runner = ScriptedRunner::succeeding();
        let report = ProcessController::new(&runner).stop(&service).unwrap();
        assert!(!report.skipped);
        let call = &runner.calls()[0];
        assert_eq!(call.cwd.as_deref(), Some(service.repo_path.as_path()));
        assert!(call.args[0].ends_with("shutdown_with_venv.py"));
        assert_eq!(call.env["PROCESS_HOST"], "127.0.0.1");
    }

    #[test]
    fn failing_start_script_is_process_start_error() {
        let dir = tempdir().unwrap();
        let service = service_in(&dir);
        with_scripts(&service);
        let runner = ScriptedRunner::new(|_| Ok(CommandOutput::exited(1, "", "port in use")));
        let err = ProcessController::new(&runner)
            .start_script(&service)
            .expect_err("start fails");
        assert_eq!(err.error_code(), "start_failed");
        assert_eq!(err.steps()[0].stderr, "port in use");
    }

    #[test]
    fn precheck_lists_missing_parts() {
        let dir = tempdir().unwrap();
        let service = service_in(&dir);
        let runner = ScriptedRunner::succeeding();
        let controller = ProcessController::new(&runner);
        let report = controller.precheck(&service);
        assert!(!report.success);
        assert_eq!(
            report.missing,
            ["repo", "service_scripts", "environment_interpreter"]
        );

        with_scripts(&service);
        let python = service.environment_python();
        fs::create_dir_all(python.parent().unwrap()).unwrap();
        fs::write(&python, "").unwrap();
        assert!(controller.precheck(&service).success);
    }

    #[test]
    fn tail_log_keeps_last_lines() {
        let dir = tempdir().unwrap();
        let service = service_in(&dir);
        assert_eq!(tail_log(&service, 3), "");
        fs::create_dir_all(&service.repo_path).unwrap();
        let content: Vec<String> = (1..=10).map(|n| format!("line {n}")).collect();
        fs::write(&service.log_path, content.join("\n")).unwrap();
        assert_eq!(tail_log(&service, 3), "line 8\nline 9\nline 10");
        assert_eq!(tail_log(&service, 50).lines().count(), 10);
    }
}
