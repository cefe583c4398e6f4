use crate::command::{run_step, CommandRunner, CommandSpec, StepRecord, DEFAULT_OUTPUT_LIMIT};
use crate::config::{absolutize, expand_path, DirtyPolicy};
use crate::error::{StewardError, SyncStage};
use crate::lock::RuntimeLock;
use crate::registry::ServiceDescriptor;
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

const REMOTE_PREFIXES: [&str; 5] = ["http://", "https://", "ssh://", "git@", "git://"];

/// Entry names never copied from a local seed tree.
const COPY_IGNORED: [&str; 9] = [
    ".git",
    ".venv",
    "__pycache__",
    ".pytest_cache",
    ".ruff_cache",
    ".forge",
    "logs",
    "library",
    "user_library",
];

const NOTHING_TO_STASH: &str = "no local changes to save";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Cloned,
    Copied,
    Existing,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncReport {
    pub repo_path: PathBuf,
    pub source_location: String,
    pub action: SyncAction,
    pub updated: bool,
    pub is_git_repo: bool,
    pub commit_before: Option<String>,
    pub commit_after: Option<String>,
    pub dirty_worktree: bool,
    pub dirty_policy: DirtyPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    pub stash_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stash_name: Option<String>,
    pub steps: Vec<StepRecord>,
}

impl SyncReport {
    fn new(service: &ServiceDescriptor, action: SyncAction, policy: DirtyPolicy) -> Self {
        Self {
            repo_path: service.repo_path.clone(),
            source_location: service.source_location.clone(),
            action,
            updated: false,
            is_git_repo: false,
            commit_before: None,
            commit_after: None,
            dirty_worktree: false,
            dirty_policy: policy,
            skipped_reason: None,
            stash_created: false,
            stash_name: None,
            steps: Vec::new(),
        }
    }
}

fn lock_runtime(service: &ServiceDescriptor) -> Result<RuntimeLock, StewardError> {
    let path = service.lock_path();
    if let Some(lock) = RuntimeLock::try_acquire(&path)? {
        return Ok(lock);
    }
    info!(service = %service.key, lock = %path.display(), "waiting for runtime lock");
    RuntimeLock::acquire(&path)
}

pub fn looks_remote(source: &str) -> bool {
    let lowered = source.trim().to_lowercase();
    REMOTE_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

pub struct RepositorySync<'a> {
    runner: &'a dyn CommandRunner,
    git: Option<PathBuf>,
    output_limit: usize,
    timeout: Option<Duration>,
}

impl<'a> RepositorySync<'a> {
    pub fn new(runner: &'a dyn CommandRunner, git: Option<PathBuf>) -> Self {
        Self {
            runner,
            git,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            timeout: Some(Duration::from_secs(900)),
        }
    }

    pub fn discover(runner: &'a dyn CommandRunner) -> Result<Self, StewardError> {
        let git = which::which("git").map_err(|_| StewardError::ToolingUnavailable {
            tool: "git".to_string(),
        })?;
        Ok(Self::new(runner, Some(git)))
    }

    pub fn with_limits(mut self, output_limit: usize, timeout: Option<Duration>) -> Self {
        self.output_limit = output_limit;
        self.timeout = timeout;
        self
    }

    fn git_bin(&self) -> Result<&Path, StewardError> {
        self.git
            .as_deref()
            .ok_or_else(|| StewardError::ToolingUnavailable {
                tool: "git".to_string(),
            })
    }

    fn git(&self, step: &str, cwd: Option<&Path>, args: &[&str]) -> Result<StepRecord, StewardError> {
        let mut spec = CommandSpec::new(self.git_bin()?)
            .args(args.iter().copied())
            .timeout(self.timeout);
        if let Some(cwd) = cwd {
            spec = spec.cwd(cwd);
        }
        Ok(run_step(self.runner, step, &spec, self.output_limit))
    }

    /// Makes sure the service source tree exists and, when asked, fast-forwards it.
    ///
    /// Holds the service's runtime lock for the whole call.
    pub fn ensure(
        &self,
        service: &ServiceDescriptor,
        update_existing: bool,
        policy: DirtyPolicy,
    ) -> Result<SyncReport, StewardError> {
        let exists = service.repo_path.exists();
        let needs_git = (update_existing && exists)
            || (!exists && looks_remote(&service.source_location));
        if needs_git {
            self.git_bin()?;
        }

        fs::create_dir_all(&service.runtime_dir)?;
        let _lock = lock_runtime(service)?;
        info!(
            service = %service.key,
            repo = %service.repo_path.display(),
            update_existing,
            "syncing service source"
        );

        let mut report = if service.repo_path.exists() {
            SyncReport::new(service, SyncAction::Existing, policy)
        } else {
            self.acquire(service, policy)?
        };
        report.is_git_repo = service.repo_path.join(".git").exists();

        // A fresh copy of a local seed has no history to fast-forward.
        if !update_existing || report.action == SyncAction::Copied {
            if report.action == SyncAction::Cloned {
                report.commit_before = self.head_commit(&service.repo_path, &mut report.steps)?;
            }
            info!(service = %service.key, action = ?report.action, "source ready");
            return Ok(report);
        }

        self.update(service, report)
    }

    fn acquire(
        &self,
        service: &ServiceDescriptor,
        policy: DirtyPolicy,
    ) -> Result<SyncReport, StewardError> {
        let source = service.source_location.trim();
        if source.is_empty() {
            return Err(StewardError::Acquisition {
                stage: SyncStage::Source,
                message: format!("no source configured for {}", service.key),
                steps: Vec::new(),
            });
        }
        if let Some(parent) = service.repo_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if looks_remote(source) {
            let target = service.repo_path.to_string_lossy().to_string();
            let step = self.git("clone", None, &["clone", source, target.as_str()])?;
            if !step.success {
                return Err(StewardError::Acquisition {
                    stage: SyncStage::Clone,
                    message: format!("failed to clone {source}"),
                    steps: vec![step],
                });
            }
            let mut report = SyncReport::new(service, SyncAction::Cloned, policy);
            report.steps.push(step);
            return Ok(report);
        }

        let source_path = absolutize(Path::new(&expand_path(source)));
        let exclude = service
            .environment_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string());
        let command = format!(
            "copy {} {}",
            source_path.display(),
            service.repo_path.display()
        );
        let step = match copy_seed_tree(&source_path, &service.repo_path, exclude.as_deref()) {
            Ok(copied) => StepRecord {
                step: "copy".to_string(),
                attempt: None,
                success: true,
                command,
                code: Some(0),
                stdout: format!("copied {copied} files"),
                stderr: String::new(),
                error: None,
            },
            Err(reason) => {
                if service.repo_path.exists() {
                    let _ = fs::remove_dir_all(&service.repo_path);
                }
                return Err(StewardError::Acquisition {
                    stage: SyncStage::Copy,
                    message: reason.clone(),
                    steps: vec![StepRecord::missing("copy", &command, reason)],
                });
            }
        };
        info!(service = %service.key, source = %source_path.display(), "copied local seed tree");
        let mut report = SyncReport::new(service, SyncAction::Copied, policy);
        report.steps.push(step);
        Ok(report)
    }

    fn update(
        &self,
        service: &ServiceDescriptor,
        mut report: SyncReport,
    ) -> Result<SyncReport, StewardError> {
        let repo = service.repo_path.as_path();
        let policy = report.dirty_policy;
        if !report.is_git_repo {
            return Err(StewardError::Acquisition {
                stage: SyncStage::NotGitRepo,
                message: format!(
                    "{} exists but is not a git repository; cannot pull updates",
                    repo.display()
                ),
                steps: report.steps,
            });
        }
        report.commit_before = self.head_commit(repo, &mut report.steps)?;

        let status = self.git("status", Some(repo), &["status", "--porcelain"])?;
        let status_ok = status.success;
        report.dirty_worktree = !status.stdout.trim().is_empty();
        report.steps.push(status);
        if !status_ok {
            return Err(StewardError::Acquisition {
                stage: SyncStage::Status,
                message: "failed to inspect worktree status".to_string(),
                steps: report.steps,
            });
        }

        if report.dirty_worktree {
            match policy {
                DirtyPolicy::Skip => {
                    info!(service = %service.key, "worktree dirty; skipping update");
                    report.skipped_reason = Some("dirty_worktree".to_string());
                    return Ok(report);
                }
                DirtyPolicy::Fail => {
                    return Err(StewardError::DirtyWorktree {
                        path: repo.to_path_buf(),
                        policy,
                        steps: report.steps,
                    });
                }
                DirtyPolicy::Stash => {
                    let name = format!(
                        "steward-runtime-auto-stash-{}",
                        Utc::now().format("%Y%m%d%H%M%S")
                    );
                    let stash = self.git(
                        "stash",
                        Some(repo),
                        &["stash", "push", "--include-untracked", "--message", name.as_str()],
                    )?;
                    let stash_ok = stash.success;
                    report.stash_created =
                        stash_ok && !stash.stdout.to_lowercase().contains(NOTHING_TO_STASH);
                    report.steps.push(stash);
                    if !stash_ok {
                        return Err(StewardError::Acquisition {
                            stage: SyncStage::Stash,
                            message: "failed to stash local changes before update".to_string(),
                            steps: report.steps,
                        });
                    }
                    info!(service = %service.key, stash = %name, created = report.stash_created, "stashed local changes");
                    report.stash_name = Some(name);
                }
            }
        }

        let fetch = self.git("fetch", Some(repo), &["fetch", "--all", "--prune"])?;
        let fetch_ok = fetch.success;
        report.steps.push(fetch);
        if !fetch_ok {
            return Err(StewardError::Acquisition {
                stage: SyncStage::Fetch,
                message: "failed to fetch upstream updates".to_string(),
                steps: report.steps,
            });
        }

        let pull = self.git("pull", Some(repo), &["pull", "--ff-only"])?;
        let pull_ok = pull.success;
        report.steps.push(pull);
        if !pull_ok {
            warn!(service = %service.key, "fast-forward pull failed");
            return Err(StewardError::Acquisition {
                stage: SyncStage::Pull,
                message: "failed to fast-forward to upstream".to_string(),
                steps: report.steps,
            });
        }

        report.commit_after = self.head_commit(repo, &mut report.steps)?;
        report.updated = matches!(
            (&report.commit_before, &report.commit_after),
            (Some(before), Some(after)) if before != after
        );
        info!(
            service = %service.key,
            updated = report.updated,
            commit = report.commit_after.as_deref().unwrap_or("unknown"),
            "source updated"
        );
        Ok(report)
    }

    /// `None` when rev-parse fails, for example on an empty repository.
    fn head_commit(
        &self,
        repo: &Path,
        steps: &mut Vec<StepRecord>,
    ) -> Result<Option<String>, StewardError> {
        let step = self.git("rev_parse", Some(repo), &["rev-parse", "HEAD"])?;
        let commit = step
            .success
            .then(|| step.stdout.trim().to_string())
            .filter(|c| !c.is_empty());
        steps.push(step);
        Ok(commit)
    }
}

/// Recursive copy that skips volatile subtrees. Returns the number of files copied.
fn copy_seed_tree(source: &Path, target: &Path, extra_ignored: Option<&str>) -> Result<usize, String> {
    if !source.is_dir() {
        return Err(format!("local seed path not found: {}", source.display()));
    }
    let source = fs::canonicalize(source).map_err(|e| e.to_string())?;
    let target = canonical_target(target)?;
    if source == target {
        return Ok(0);
    }
    if source.starts_with(&target) {
        return Err(format!(
            "target '{}' cannot be a parent of source '{}'",
            target.display(),
            source.display()
        ));
    }
    if target.starts_with(&source) {
        return Err(format!(
            "target '{}' cannot be inside source '{}'",
            target.display(),
            source.display()
        ));
    }

    let skip = |name: &str| COPY_IGNORED.contains(&name) || extra_ignored == Some(name);
    let walker = WalkDir::new(&source)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !skip(&e.file_name().to_string_lossy()));

    let mut copied = 0;
    for entry in walker {
        let entry = entry.map_err(|e| e.to_string())?;
        let rel = entry
            .path()
            .strip_prefix(&source)
            .map_err(|e| e.to_string())?;
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| format!("{}: {e}", dest.display()))?;
        } else if entry.path().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| format!("{}: {e}", parent.display()))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| format!("{}: {e}", dest.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Canonical form of a path whose last component may not exist yet.
fn canonical_target(target: &Path) -> Result<PathBuf, String> {
    if target.exists() {
        return fs::canonicalize(target).map_err(|e| e.to_string());
    }
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let name = target
        .file_name()
        .ok_or_else(|| format!("invalid target path: {}", target.display()))?;
    let parent = fs::canonicalize(parent).map_err(|e| e.to_string())?;
    Ok(parent.join(name))
}
