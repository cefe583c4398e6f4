use crate::command::{
    run_script, run_step, CommandRunner, CommandSpec, ScriptCall, StepOutcome, StepRecord,
    DEFAULT_OUTPUT_LIMIT,
};
use crate::error::{BuildStage, StewardError};
use crate::registry::ServiceDescriptor;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

pub const FORCE_RECREATE_ENV: &str = "VENV_FORCE_RECREATE";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProvisionReport {
    /// Attempt on which the environment became usable.
    pub attempts: u32,
    /// True when the repair sequence, not the install script, produced the working environment.
    pub repaired: bool,
    pub steps: Vec<StepRecord>,
}

/// Builds and verifies the isolated runtime, repairing it when the normal path fails.
pub struct EnvironmentProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    max_attempts: u32,
    timeout: Option<Duration>,
    output_limit: usize,
}

enum AttemptResult {
    Ready { repaired: bool },
    Failed(BuildStage),
}

impl<'a> EnvironmentProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, max_attempts: u32) -> Self {
        Self {
            runner,
            max_attempts: max_attempts.max(1),
            timeout: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_limits(mut self, output_limit: usize, timeout: Option<Duration>) -> Self {
        self.output_limit = output_limit;
        self.timeout = timeout;
        self
    }

    pub fn provision(
        &self,
        service: &ServiceDescriptor,
        force_recreate: bool,
    ) -> Result<ProvisionReport, StewardError> {
        let base_env = service.default_env_values();
        let mut steps = Vec::new();
        let mut reason = BuildStage::Install;

        for attempt in 1..=self.max_attempts {
            let mut env = base_env.clone();
            if force_recreate || attempt > 1 {
                env.insert(FORCE_RECREATE_ENV.to_string(), "1".to_string());
            }
            info!(service = %service.key, attempt, "provisioning runtime environment");
            match self.attempt(service, &env, attempt, &mut steps) {
                AttemptResult::Ready { repaired } => {
                    info!(service = %service.key, attempt, repaired, "runtime environment ready");
                    return Ok(ProvisionReport {
                        attempts: attempt,
                        repaired,
                        steps,
                    });
                }
                AttemptResult::Failed(stage) => {
                    warn!(
                        service = %service.key,
                        attempt,
                        stage = stage.as_str(),
                        "provisioning attempt failed"
                    );
                    reason = stage;
                }
            }
        }

        Err(StewardError::EnvironmentBuild { reason, steps })
    }

    fn attempt(
        &self,
        service: &ServiceDescriptor,
        env: &BTreeMap<String, String>,
        attempt: u32,
        steps: &mut Vec<StepRecord>,
    ) -> AttemptResult {
        let create = self
            .script(service, "create_venv", &service.scripts.create_env, env)
            .with_attempt(attempt);
        let created = create.success;
        steps.push(create);
        if !created {
            return AttemptResult::Failed(BuildStage::CreateVenv);
        }

        let install = self
            .script(service, "install_with_venv", &service.scripts.install, env)
            .with_attempt(attempt);
        let installed = install.success;
        steps.push(install);

        let verify = self
            .verify(service, env, "verify_runtime_dependencies")
            .with_attempt(attempt);
        let verified = verify.success;
        steps.push(verify);

        if installed && verified {
            return AttemptResult::Ready { repaired: false };
        }

        info!(service = %service.key, attempt, installed, verified, "running dependency repair");
        if self.repair(service, env, attempt, steps) {
            return AttemptResult::Ready { repaired: true };
        }
        AttemptResult::Failed(if installed {
            BuildStage::Verify
        } else {
            BuildStage::Install
        })
    }

    /// Upgrades pip, reinstalls from requirements.txt when present, force-installs the
    /// runtime packages, then verifies again. Only the final verify decides success.
    fn repair(
        &self,
        service: &ServiceDescriptor,
        env: &BTreeMap<String, String>,
        attempt: u32,
        steps: &mut Vec<StepRecord>,
    ) -> bool {
        steps.push(
            self.environment_python(
                service,
                env,
                "repair_pip_upgrade",
                &["-m", "pip", "install", "--upgrade", "pip"],
            )
            .with_attempt(attempt),
        );

        let requirements = service.repo_path.join("requirements.txt");
        if requirements.is_file() {
            let requirements = requirements.to_string_lossy().to_string();
            steps.push(
                self.environment_python(
                    service,
                    env,
                    "repair_requirements",
                    &["-m", "pip", "install", "-r", requirements.as_str()],
                )
                .with_attempt(attempt),
            );
        }

        let mut args = vec!["-m", "pip", "install", "--upgrade"];
        args.extend(service.runtime_packages.iter().map(String::as_str));
        steps.push(
            self.environment_python(service, env, "repair_runtime_packages", &args)
                .with_attempt(attempt),
        );

        let verify = self.verify(service, env, "repair_verify").with_attempt(attempt);
        let ok = verify.success;
        steps.push(verify);
        ok
    }

    fn verify(
        &self,
        service: &ServiceDescriptor,
        env: &BTreeMap<String, String>,
        step: &str,
    ) -> StepRecord {
        self.environment_python(service, env, step, &["-c", service.import_check.as_str()])
    }

    fn environment_python(
        &self,
        service: &ServiceDescriptor,
        env: &BTreeMap<String, String>,
        step: &str,
        args: &[&str],
    ) -> StepRecord {
        let python = service.environment_python();
        if !python.is_file() {
            return StepRecord::missing(
                step,
                "",
                format!("environment interpreter missing: {}", python.display()),
            );
        }
        let spec = CommandSpec::new(python)
            .args(args.iter().copied())
            .cwd(&service.repo_path)
            .envs(env)
            .timeout(self.timeout);
        run_step(self.runner, step, &spec, self.output_limit)
    }

    fn script(
        &self,
        service: &ServiceDescriptor,
        step: &str,
        name: &str,
        env: &BTreeMap<String, String>,
    ) -> StepRecord {
        let script = service.script(name);
        run_script(
            self.runner,
            step,
            &ScriptCall {
                interpreter: &service.interpreter,
                script: &script,
                cwd: &service.repo_path,
                env,
                timeout: self.timeout,
                limit: self.output_limit,
            },
        )
    }

    /// Runs the service's database initialisation script when it ships one.
    pub fn run_init(
        &self,
        service: &ServiceDescriptor,
    ) -> Result<StepOutcome<StepRecord>, StewardError> {
        if !service.script(&service.scripts.init).is_file() {
            return Ok(StepOutcome::Skipped("init script not present".to_string()));
        }
        let step = self.script(
            service,
            "init_db",
            &service.scripts.init,
            &service.default_env_values(),
        );
        if !step.success {
            return Err(StewardError::ScriptFailed { step });
        }
        info!(service = %service.key, "database initialised");
        Ok(StepOutcome::Ok(step))
    }
}
