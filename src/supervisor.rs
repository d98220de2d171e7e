// ABOUTME: Worker process supervision for the master
//
// Spawns the configured number of worker processes and replaces each one the
// moment it exits. There is no backoff and no restart limit, so a worker that
// crashes on startup is respawned in a tight loop until the operator
// intervenes. A replacement that cannot even be spawned is retried on a fixed
// interval. Shutdown sends SIGTERM, then SIGKILL after a grace period.

#![allow(clippy::option_if_let_else)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Placeholder in worker arguments replaced by the worker's sequence number.
pub const WORKER_ID_PLACEHOLDER: &str = "{id}";

/// Environment variable carrying the worker's sequence number.
pub const WORKER_ID_ENV: &str = "SKYLINE_WORKER_ID";

/// Default delay between attempts to replace a worker that failed to spawn
const RESPAWN_RETRY: Duration = Duration::from_millis(500);

/// Errors that can occur during worker supervision
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Locating the current executable failed
    #[error("Failed to locate current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    /// A worker process could not be spawned
    #[error("Failed to spawn worker {worker_id}: {source}")]
    SpawnFailed {
        worker_id: u32,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called twice
    #[error("Supervisor already started")]
    AlreadyStarted,

    /// Worker count of zero
    #[error("Worker count must be at least 1")]
    NoWorkers,
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited with a status code
    Code(i32),
    /// Terminated by a signal
    Signal(i32),
    /// Waiting on the process failed
    Unknown,
}

impl WorkerExit {
    fn from_status(status: &std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => {
                if let Some(code) = status.code() {
                    return Self::Code(code);
                }
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return Self::Signal(signal);
                    }
                }
                Self::Unknown
            }
            Err(_) => Self::Unknown,
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Lifecycle notifications published by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A worker process started
    Spawned { worker_id: u32, pid: u32 },
    /// A worker process ended; a replacement follows unless shutting down
    Exited {
        worker_id: u32,
        pid: u32,
        exit: WorkerExit,
    },
    /// A replacement could not be started
    SpawnFailed { worker_id: u32, reason: String },
}

/// The program and arguments each worker runs.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// Arbitrary program. `{id}` inside an argument is replaced per worker.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-execute this binary in worker mode.
    pub fn current_exe(config_path: Option<&Path>, log_stderr: bool) -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;

        let mut args: Vec<OsString> = Vec::new();
        if log_stderr {
            args.push("--log-stderr".into());
        }
        args.extend(["worker".into(), "--id".into(), WORKER_ID_PLACEHOLDER.into()]);
        if let Some(path) = config_path {
            args.push("--config".into());
            args.push(path.as_os_str().to_owned());
        }

        Ok(Self { program, args })
    }

    fn build(&self, worker_id: u32) -> Command {
        let id = worker_id.to_string();
        let mut cmd = Command::new(&self.program);

        for arg in &self.args {
            match arg.to_str() {
                Some(text) if text.contains(WORKER_ID_PLACEHOLDER) => {
                    cmd.arg(text.replace(WORKER_ID_PLACEHOLDER, &id));
                }
                _ => {
                    cmd.arg(arg);
                }
            }
        }

        cmd.env(WORKER_ID_ENV, &id)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

type WaitResult = (u32, u32, std::io::Result<ExitStatus>);

/// Keeps `workers` worker processes alive.
pub struct WorkerSupervisor {
    command: WorkerCommand,
    workers: usize,
    next_id: u32,
    live: HashMap<u32, u32>,
    waits: JoinSet<WaitResult>,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    respawns: u64,
    pending_respawns: usize,
    retry_interval: Duration,
    grace: Duration,
    started: bool,
}

impl WorkerSupervisor {
    /// Supervisor for `workers` copies of `command`
    #[must_use]
    pub fn new(command: WorkerCommand, workers: usize) -> Self {
        Self {
            command,
            workers,
            next_id: 1,
            live: HashMap::new(),
            waits: JoinSet::new(),
            events: None,
            respawns: 0,
            pending_respawns: 0,
            retry_interval: RESPAWN_RETRY,
            grace: Duration::from_secs(2),
            started: false,
        }
    }

    /// Publish lifecycle events on the returned channel.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SupervisorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Time between SIGTERM and SIGKILL at shutdown
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Delay between attempts to replace a worker that failed to spawn
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Spawn the initial workers.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.started {
            return Err(SupervisorError::AlreadyStarted);
        }
        if self.workers == 0 {
            return Err(SupervisorError::NoWorkers);
        }
        self.started = true;

        info!(workers = self.workers, program = %self.command.program.display(), "Starting workers");
        for _ in 0..self.workers {
            self.spawn_next()?;
        }
        Ok(())
    }

    /// Replace exiting workers until `shutdown` resolves, then stop them all.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut retry = tokio::time::interval(self.retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retrying = self.pending_respawns > 0;
            tokio::select! {
                () = &mut shutdown => break,
                Some(joined) = self.waits.join_next() => {
                    match joined {
                        Ok((worker_id, pid, status)) => {
                            self.on_exit(worker_id, pid, &status);
                            if self.pending_respawns > 0 {
                                retry.reset();
                            }
                        }
                        Err(e) => error!(error = %e, "Worker wait task failed"),
                    }
                }
                _ = retry.tick(), if retrying => self.retry_respawns(),
            }
        }

        self.pending_respawns = 0;
        self.terminate_all().await;
    }

    /// Workers currently running
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.live.len()
    }

    /// Replacements spawned so far
    #[must_use]
    pub const fn respawn_count(&self) -> u64 {
        self.respawns
    }

    fn on_exit(&mut self, worker_id: u32, pid: u32, status: &std::io::Result<ExitStatus>) {
        self.live.remove(&worker_id);
        let exit = WorkerExit::from_status(status);
        warn!(worker_id, pid, exit = %exit, "Worker exited, respawning");
        self.emit(SupervisorEvent::Exited { worker_id, pid, exit });

        match self.spawn_next() {
            Ok(()) => self.respawns += 1,
            Err(e) => {
                self.pending_respawns += 1;
                error!(error = %e, pending = self.pending_respawns, "Failed to respawn worker, will retry");
            }
        }
    }

    fn retry_respawns(&mut self) {
        while self.pending_respawns > 0 {
            match self.spawn_next() {
                Ok(()) => {
                    self.pending_respawns -= 1;
                    self.respawns += 1;
                }
                Err(e) => {
                    warn!(error = %e, pending = self.pending_respawns, "Respawn retry failed");
                    return;
                }
            }
        }
        info!(workers = self.live.len(), "Worker pool back to full strength");
    }

    fn spawn_next(&mut self) -> Result<(), SupervisorError> {
        let worker_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let mut child = match self.command.build(worker_id).spawn() {
            Ok(child) => child,
            Err(source) => {
                self.emit(SupervisorEvent::SpawnFailed {
                    worker_id,
                    reason: source.to_string(),
                });
                return Err(SupervisorError::SpawnFailed { worker_id, source });
            }
        };

        let pid = child.id().unwrap_or(0);
        info!(worker_id, pid, "Worker spawned");
        self.live.insert(worker_id, pid);
        self.emit(SupervisorEvent::Spawned { worker_id, pid });

        self.waits.spawn(async move {
            let status = child.wait().await;
            (worker_id, pid, status)
        });
        Ok(())
    }

    async fn terminate_all(&mut self) {
        if self.live.is_empty() {
            self.waits.shutdown().await;
            return;
        }

        info!(workers = self.live.len(), "Terminating workers");
        for (&worker_id, &pid) in &self.live {
            debug!(worker_id, pid, "Sending SIGTERM");
            signal_pid(pid, Signal::Term);
        }

        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = self.waits.join_next().await {
                if let Ok((worker_id, pid, status)) = joined {
                    self.live.remove(&worker_id);
                    let exit = WorkerExit::from_status(&status);
                    debug!(worker_id, pid, exit = %exit, "Worker stopped");
                    self.emit(SupervisorEvent::Exited { worker_id, pid, exit });
                }
            }
        })
        .await;

        if drained.is_err() {
            for (&worker_id, &pid) in &self.live {
                warn!(worker_id, pid, "Worker did not terminate gracefully, sending SIGKILL");
                signal_pid(pid, Signal::Kill);
            }
        }

        // Dropping the wait tasks drops their children, which kills stragglers.
        self.waits.shutdown().await;
        self.live.clear();
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

fn signal_pid(pid: u32, signal: Signal) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal as NixSignal, kill};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if raw <= 0 {
            return;
        }
        let signal = match signal {
            Signal::Term => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };
        if let Err(e) = kill(Pid::from_raw(raw), signal) {
            debug!(pid, error = %e, "Signal delivery failed");
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}
