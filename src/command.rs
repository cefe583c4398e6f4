//! Subprocess execution and the per-step diagnostic record every stage returns.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Captured stdout/stderr longer than this is cut down before it lands in a step log.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1500;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// How long output is still collected after the child itself has exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        for (key, value) in env {
            self.env.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human-readable command line, quoted only where whitespace would make it ambiguous.
    pub fn render(&self) -> String {
        fn shell_quote(part: &str) -> String {
            if part.is_empty() {
                return "\"\"".to_string();
            }
            if part.chars().any(|c| c.is_whitespace()) {
                return format!("\"{}\"", part.replace('"', "\\\""));
            }
            part.to_string()
        }
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program.to_string_lossy()));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }

    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|arg| arg == needle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal or by the timeout.
    pub status_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0) && !self.timed_out
    }

    pub fn exited(status_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            status_code: Some(status_code),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            timed_out: false,
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error>;
}

/// Runs commands as real child processes of this one.
///
/// Each child leads its own process group, so a timeout takes down everything
/// the command forked.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        let mut child = cmd.spawn()?;
        let (tx, rx) = mpsc::channel();
        spawn_pipe_reader(child.stdout.take(), Pipe::Stdout, tx.clone());
        spawn_pipe_reader(child.stderr.take(), Pipe::Stderr, tx);

        let (status_code, timed_out) = wait_with_deadline(&mut child, spec.timeout)?;
        let (stdout, mut stderr) = collect_pipes(&rx, PIPE_DRAIN_GRACE);
        if timed_out {
            if let Some(limit) = spec.timeout {
                stderr.extend_from_slice(
                    format!("\n[killed after {}s timeout]", limit.as_secs()).as_bytes(),
                );
            }
        }
        Ok(CommandOutput {
            status_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

enum PipeEvent {
    Data(Pipe, Vec<u8>),
    Closed(Pipe),
}

fn spawn_pipe_reader<P>(pipe: Option<P>, which: Pipe, tx: Sender<PipeEvent>)
where
    P: Read + Send + 'static,
{
    thread::spawn(move || {
        if let Some(mut pipe) = pipe {
            let mut buf = [0u8; 8192];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(PipeEvent::Data(which, buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        let _ = tx.send(PipeEvent::Closed(which));
    });
}

/// Gathers both pipes until they close or `grace` runs out.
///
/// A descendant that escaped the process group can hold a pipe open forever;
/// whatever arrived before the grace period ended is returned.
fn collect_pipes(rx: &Receiver<PipeEvent>, grace: Duration) -> (Vec<u8>, Vec<u8>) {
    let deadline = Instant::now() + grace;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut open = 2;
    while open > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(PipeEvent::Data(Pipe::Stdout, bytes)) => stdout.extend_from_slice(&bytes),
            Ok(PipeEvent::Data(Pipe::Stderr, bytes)) => stderr.extend_from_slice(&bytes),
            Ok(PipeEvent::Closed(_)) => open -= 1,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    (stdout, stderr)
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<(Option<i32>, bool), io::Error> {
    let Some(timeout) = timeout else {
        let status = child.wait()?;
        return Ok((status.code(), false));
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status.code(), false));
        }
        if Instant::now() >= deadline {
            kill_process_group(child);
            let _ = child.wait();
            return Ok((None, true));
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let group = Pid::from_raw(child.id() as i32);
        if let Err(err) = killpg(group, Signal::SIGKILL) {
            warn!(pgid = child.id(), error = %err, "failed to kill process group");
        }
    }
    let _ = child.kill();
}

pub fn truncate_output(value: &str, limit: usize) -> String {
    let total = value.chars().count();
    if total <= limit {
        return value.to_string();
    }
    let kept: String = value.chars().take(limit).collect();
    format!("{kept}... [truncated {} chars]", total - limit)
}

/// Result of one atomic step: a command run, a probe, or a file operation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub success: bool,
    pub command: String,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    pub fn from_output(step: &str, spec: &CommandSpec, output: &CommandOutput, limit: usize) -> Self {
        Self {
            step: step.to_string(),
            attempt: None,
            success: output.success(),
            command: spec.render(),
            code: output.status_code,
            stdout: truncate_output(&output.stdout_text(), limit),
            stderr: truncate_output(&output.stderr_text(), limit),
            error: output.timed_out.then(|| "command timed out".to_string()),
        }
    }

    pub fn spawn_failed(step: &str, spec: &CommandSpec, err: &io::Error) -> Self {
        Self {
            step: step.to_string(),
            attempt: None,
            success: false,
            command: spec.render(),
            code: None,
            stdout: String::new(),
            stderr: err.to_string(),
            error: Some(format!("failed to run command: {err}")),
        }
    }

    /// A step that could not run because a precondition (script, interpreter) is absent.
    pub fn missing(step: &str, command: &str, reason: String) -> Self {
        Self {
            step: step.to_string(),
            attempt: None,
            success: false,
            command: command.to_string(),
            code: Some(1),
            stdout: String::new(),
            stderr: reason.clone(),
            error: Some(reason),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

pub fn run_step(
    runner: &dyn CommandRunner,
    step: &str,
    spec: &CommandSpec,
    limit: usize,
) -> StepRecord {
    match runner.run(spec) {
        Ok(output) => StepRecord::from_output(step, spec, &output, limit),
        Err(err) => StepRecord::spawn_failed(step, spec, &err),
    }
}

pub struct ScriptCall<'a> {
    pub interpreter: &'a Path,
    pub script: &'a Path,
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub limit: usize,
}

/// Runs a script from the managed service's own tree; a missing script is a failed step.
pub fn run_script(runner: &dyn CommandRunner, step: &str, call: &ScriptCall<'_>) -> StepRecord {
    if !call.script.is_file() {
        return StepRecord::missing(
            step,
            "",
            format!("missing script: {}", call.script.display()),
        );
    }
    let spec = CommandSpec::new(call.interpreter)
        .arg(call.script.to_string_lossy())
        .cwd(call.cwd)
        .envs(call.env)
        .timeout(call.timeout);
    run_step(runner, step, &spec, call.limit)
}

/// Outcome of an optional step, so callers can tell "did not run" from "ran and failed".
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StepOutcome<T> {
    Ok(T),
    Skipped(String),
    Failed(String),
}

impl<T> StepOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StepOutcome::Skipped(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            StepOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }
}
