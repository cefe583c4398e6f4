//! Install, start and update workflows.
//!
//! Every blocking stage runs on the blocking pool, one after another; a call
//! never has two stages in flight. Only source sync takes the runtime lock, so
//! callers must not overlap prepare/start calls for the same service.

use crate::bootstrap::{normalizer_for, BootstrapReport, UserBootstrapper};
use crate::command::{CommandRunner, StepOutcome, StepRecord};
use crate::config::{DirtyPolicy, Settings};
use crate::envfile::{EnvFileMaterializer, EnvWrite};
use crate::error::{ErrorDetails, StewardError};
use crate::health::{HealthPoller, PollReport, ProbeResult};
use crate::jobs::{idempotency_key, InstallJob, JobQueue, INSTALL_JOB_TYPE};
use crate::process::{tail_log, PrecheckReport, ProcessController, StopReport};
use crate::provision::EnvironmentProvisioner;
use crate::registry::{ServiceDescriptor, ServiceRegistry};
use crate::sync::{RepositorySync, SyncReport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub full_install: bool,
    pub force_recreate: bool,
    pub installer_user_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub update: bool,
    pub auto_start: bool,
    pub prepare: PrepareOptions,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PrepareReport {
    pub service: String,
    pub attempts: u32,
    pub repaired: bool,
    pub steps: Vec<StepRecord>,
    pub env: EnvWrite,
    pub init: StepOutcome<StepRecord>,
    pub bootstrap_user: StepOutcome<BootstrapReport>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StartReport {
    pub service: String,
    pub env: EnvWrite,
    pub start: StepRecord,
    pub health: PollReport,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstallReport {
    pub service: String,
    /// False when the service was prepared but could not be started.
    pub ok: bool,
    pub sync: SyncReport,
    pub prepare: PrepareReport,
    pub start: StepOutcome<StartReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_error: Option<ErrorDetails>,
    pub health: StepOutcome<ProbeResult>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InstallDispatch {
    Job {
        job_id: String,
        idempotency_key: String,
    },
    Inline {
        enqueue_error: String,
        reports: Vec<InstallReport>,
    },
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    registry: Arc<ServiceRegistry>,
    runner: Arc<dyn CommandRunner>,
    poller: HealthPoller,
    git: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(settings: Settings, runner: Arc<dyn CommandRunner>) -> Result<Self, StewardError> {
        let poller = HealthPoller::new(&settings.health)?;
        let registry = ServiceRegistry::from_settings(&settings);
        Ok(Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            runner,
            poller,
            git: which::which("git").ok(),
        })
    }

    pub fn with_git(mut self, git: Option<PathBuf>) -> Self {
        self.git = git;
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    fn service(&self, key: &str) -> Result<ServiceDescriptor, StewardError> {
        self.registry.get(key).cloned()
    }

    fn command_timeout(&self) -> Option<Duration> {
        (self.settings.command_timeout_sec > 0)
            .then(|| Duration::from_secs(self.settings.command_timeout_sec))
    }

    fn git_timeout(&self) -> Option<Duration> {
        (self.settings.git_timeout_sec > 0).then(|| Duration::from_secs(self.settings.git_timeout_sec))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StewardError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CommandRunner) -> Result<T, StewardError> + Send + 'static,
    {
        let runner = Arc::clone(&self.runner);
        tokio::task::spawn_blocking(move || f(&*runner))
            .await
            .map_err(|err| StewardError::Join(err.to_string()))?
    }

    pub async fn sync_source(
        &self,
        key: &str,
        update_existing: bool,
        policy: Option<DirtyPolicy>,
    ) -> Result<SyncReport, StewardError> {
        let service = self.service(key)?;
        let policy = policy.unwrap_or(self.settings.dirty_policy);
        let git = self.git.clone();
        let limit = self.settings.output_limit;
        let timeout = self.git_timeout();
        self.blocking(move |runner| {
            RepositorySync::new(runner, git)
                .with_limits(limit, timeout)
                .ensure(&service, update_existing, policy)
        })
        .await
    }

    pub async fn materialize_env(
        &self,
        key: &str,
        overrides: BTreeMap<String, String>,
        backup: bool,
    ) -> Result<EnvWrite, StewardError> {
        let service = self.service(key)?;
        self.blocking(move |_| EnvFileMaterializer::materialize(&service, &overrides, None, backup))
            .await
    }

    /// Env file, environment build, then the optional init and user bootstrap.
    ///
    /// Expects the source tree to be present already.
    pub async fn prepare_service(
        &self,
        key: &str,
        options: PrepareOptions,
    ) -> Result<PrepareReport, StewardError> {
        let service = self.service(key)?;
        let env = self
            .materialize_env(key, BTreeMap::new(), false)
            .await
            .map_err(|source| StewardError::Workflow {
                step: "materialize_env".to_string(),
                steps: Vec::new(),
                source: Box::new(source),
            })?;

        let attempts = self.settings.install_attempts;
        let limit = self.settings.output_limit;
        let timeout = self.command_timeout();
        let full_install = options.full_install;
        let force_recreate = options.force_recreate;
        let provisioned = service.clone();
        let (provision, init) = self
            .blocking(move |runner| {
                let provisioner =
                    EnvironmentProvisioner::new(runner, attempts).with_limits(limit, timeout);
                let provision = provisioner.provision(&provisioned, force_recreate)?;
                if !full_install {
                    let skipped = StepOutcome::Skipped("full install not requested".to_string());
                    return Ok((provision, skipped));
                }
                match provisioner.run_init(&provisioned) {
                    Ok(init) => Ok((provision, init)),
                    Err(source) => Err(StewardError::Workflow {
                        step: "init_db".to_string(),
                        steps: provision.steps,
                        source: Box::new(source),
                    }),
                }
            })
            .await?;

        let bootstrap_user = match options.installer_user_id {
            None => StepOutcome::Skipped("no installer user supplied".to_string()),
            Some(user) => match self.bootstrap_user(key, &user).await {
                Ok(report) => StepOutcome::Ok(report),
                Err(source) => {
                    return Err(StewardError::Workflow {
                        step: "bootstrap_user".to_string(),
                        steps: provision.steps,
                        source: Box::new(source),
                    })
                }
            },
        };

        info!(
            service = %service.key,
            attempts = provision.attempts,
            repaired = provision.repaired,
            "service prepared"
        );
        Ok(PrepareReport {
            service: service.key,
            attempts: provision.attempts,
            repaired: provision.repaired,
            steps: provision.steps,
            env,
            init,
            bootstrap_user,
        })
    }

    /// Seeds one user's library without touching the rest of the service.
    pub async fn bootstrap_user(
        &self,
        key: &str,
        identity: &str,
    ) -> Result<BootstrapReport, StewardError> {
        let service = self.service(key)?;
        let identity = identity.to_string();
        self.blocking(move |_| {
            let normalizer = normalizer_for(&service.schema);
            UserBootstrapper::new(normalizer.as_ref()).bootstrap(&service, &identity)
        })
        .await
    }

    /// Start script, then health polling. A failed script is returned without polling.
    pub async fn start_service(&self, key: &str) -> Result<StartReport, StewardError> {
        let service = self.service(key)?;
        let env = self.materialize_env(key, BTreeMap::new(), false).await?;

        let limit = self.settings.output_limit;
        let timeout = self.command_timeout();
        let target = service.clone();
        let start = self
            .blocking(move |runner| {
                ProcessController::new(runner)
                    .with_limits(limit, timeout)
                    .start_script(&target)
            })
            .await?;

        let health = self.poller.wait_until_healthy(&service.health_url).await;
        if !health.success {
            let lines = self.settings.log_tail_lines;
            let target = service.clone();
            let log_tail = self.blocking(move |_| Ok(tail_log(&target, lines))).await?;
            return Err(StewardError::HealthTimeout {
                start,
                poll: health,
                log_tail,
            });
        }
        Ok(StartReport {
            service: service.key,
            env,
            start,
            health,
        })
    }

    pub async fn shutdown_service(&self, key: &str) -> Result<StopReport, StewardError> {
        let service = self.service(key)?;
        let limit = self.settings.output_limit;
        let timeout = self.command_timeout();
        self.blocking(move |runner| {
            ProcessController::new(runner)
                .with_limits(limit, timeout)
                .stop(&service)
        })
        .await
    }

    /// Stop (result ignored), then start.
    pub async fn restart_service(&self, key: &str) -> Result<StartReport, StewardError> {
        if let Err(err) = self.shutdown_service(key).await {
            if matches!(err, StewardError::UnknownService(_)) {
                return Err(err);
            }
            warn!(service = key, error = %err, "stop before restart failed; starting anyway");
        }
        self.start_service(key).await
    }

    pub async fn health_check(
        &self,
        key: &str,
        override_url: Option<&str>,
    ) -> Result<ProbeResult, StewardError> {
        let service = self.service(key)?;
        let url = override_url
            .map(str::to_string)
            .unwrap_or_else(|| service.health_url.clone());
        Ok(self.poller.probe(&url).await)
    }

    pub async fn precheck(&self, key: &str) -> Result<PrecheckReport, StewardError> {
        let service = self.service(key)?;
        self.blocking(move |runner| Ok(ProcessController::new(runner).precheck(&service)))
            .await
    }

    /// Sync, prepare, then (optionally) start with a post-start health snapshot.
    pub async fn install_service(
        &self,
        key: &str,
        options: InstallOptions,
    ) -> Result<InstallReport, StewardError> {
        let sync = self.sync_source(key, options.update, None).await?;
        let prepare = match self.prepare_service(key, options.prepare.clone()).await {
            Ok(report) => report,
            Err(source) => {
                let step = source
                    .failed_step()
                    .unwrap_or_else(|| "prepare_service".to_string());
                return Err(StewardError::Workflow {
                    step,
                    steps: sync.steps,
                    source: Box::new(source),
                });
            }
        };

        if !options.auto_start {
            return Ok(InstallReport {
                service: prepare.service.clone(),
                ok: true,
                sync,
                prepare,
                start: StepOutcome::Skipped("auto start disabled".to_string()),
                start_error: None,
                health: StepOutcome::Skipped("service not started".to_string()),
            });
        }

        let started = if options.update {
            self.restart_service(key).await
        } else {
            self.start_service(key).await
        };
        let (start, start_error, health) = match started {
            Ok(report) => {
                let health = match self.health_check(key, None).await {
                    Ok(probe) if probe.success => StepOutcome::Ok(probe),
                    Ok(probe) => StepOutcome::Failed(
                        probe
                            .error
                            .unwrap_or_else(|| "health probe failed".to_string()),
                    ),
                    Err(err) => StepOutcome::Failed(err.to_string()),
                };
                (StepOutcome::Ok(report), None, health)
            }
            Err(err) => {
                warn!(service = key, error = %err, "service prepared but failed to start");
                (
                    StepOutcome::Failed(err.to_string()),
                    Some(err.details()),
                    StepOutcome::Skipped("service not started".to_string()),
                )
            }
        };

        Ok(InstallReport {
            service: prepare.service.clone(),
            ok: start.is_ok(),
            sync,
            prepare,
            start,
            start_error,
            health,
        })
    }

    pub async fn update_service(
        &self,
        key: &str,
        options: InstallOptions,
    ) -> Result<InstallReport, StewardError> {
        self.install_service(
            key,
            InstallOptions {
                update: true,
                ..options
            },
        )
        .await
    }

    /// Hands the install to `queue`; runs it inline if the queue refuses.
    pub async fn schedule_install(
        &self,
        queue: &dyn JobQueue,
        service_keys: Vec<String>,
        options: InstallOptions,
    ) -> Result<InstallDispatch, StewardError> {
        for key in &service_keys {
            self.service(key)?;
        }
        let user = options.prepare.installer_user_id.clone();
        let job = InstallJob {
            service_keys: service_keys.clone(),
            full_install: options.prepare.full_install,
            force_recreate: options.prepare.force_recreate,
            auto_start: options.auto_start,
            require_user_bootstrap: user.is_some(),
            installer_user_id: user.clone(),
        };
        let payload = serde_json::to_value(&job)?;
        let key = idempotency_key(user.as_deref(), env!("CARGO_PKG_VERSION"));

        match queue.enqueue(INSTALL_JOB_TYPE, &payload, &key) {
            Ok(job_id) => {
                info!(job_id = %job_id, "install job enqueued");
                Ok(InstallDispatch::Job {
                    job_id,
                    idempotency_key: key,
                })
            }
            Err(err) => {
                warn!(error = %err, "install job enqueue failed; running inline");
                let mut reports = Vec::with_capacity(service_keys.len());
                for service_key in &service_keys {
                    reports.push(self.install_service(service_key, options.clone()).await?);
                }
                Ok(InstallDispatch::Inline {
                    enqueue_error: err.to_string(),
                    reports,
                })
            }
        }
    }
}
