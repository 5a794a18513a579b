use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::protocol::Conversation;
use crate::reader::{LineReader, spawn_drain};

/// Whether the child can take a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    Starting,
    Ready,
    Exited,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReadinessState::Starting => "starting",
            ReadinessState::Ready => "ready",
            ReadinessState::Exited => "exited",
        };
        f.write_str(text)
    }
}

/// Read side of the supervisor's state, consulted before each job.
pub trait Liveness: Send + Sync {
    fn readiness(&self) -> ReadinessState;
}

/// How to launch the synthesis executable.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    fn command_line(&self) -> String {
        let mut parts = vec![self.executable.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

pub type ChildConversation = Conversation<ChildStdin, BufReader<ChildStdout>>;

/// Owns the synthesis child process for the lifetime of the server.
///
/// The child's stdin/stdout are handed out once, as a [`ChildConversation`],
/// to the single worker. Dropping the supervisor terminates the child.
pub struct Supervisor {
    child: Mutex<Child>,
    state: Mutex<ReadinessState>,
    terminated: AtomicBool,
    program: String,
}

impl Supervisor {
    /// Spawn the child and start draining its stderr into the log.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(spec: &LaunchSpec) -> Result<(Self, ChildConversation), SupervisorError> {
        info!(
            "Starting melotts process: {} from {}",
            spec.command_line(),
            spec.working_dir.display()
        );

        let mut child = Command::new(&spec.executable)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SupervisorError::ExecutableNotFound(spec.executable.clone())
                } else {
                    SupervisorError::Spawn {
                        path: spec.executable.clone(),
                        source: e,
                    }
                }
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(SupervisorError::MissingStream("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingStream("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::MissingStream("stderr"))?;

        spawn_drain(stderr, "melotts-stderr");

        debug!("melotts process spawned with pid {:?}", child.id());
        let supervisor = Self {
            child: Mutex::new(child),
            state: Mutex::new(ReadinessState::Starting),
            terminated: AtomicBool::new(false),
            program: spec.executable.display().to_string(),
        };
        let conversation = Conversation::new(
            stdin,
            LineReader::new(BufReader::new(stdout), "melotts-stdout"),
        );
        Ok((supervisor, conversation))
    }

    /// Read startup output until a line contains `marker`.
    pub async fn await_ready<R>(
        &self,
        stdout: &mut LineReader<R>,
        marker: &str,
        limit: Duration,
    ) -> Result<(), SupervisorError>
    where
        R: AsyncBufRead + Unpin,
    {
        info!("Waiting for melotts process to initialize...");
        let read = stdout.read_until(marker, |_| {});
        match tokio::time::timeout(limit, read).await {
            Ok(Ok(outcome)) if outcome.matched => {
                self.set_state(ReadinessState::Ready);
                info!("Melotts process is ready to accept requests");
                Ok(())
            }
            Ok(Ok(_)) => {
                self.set_state(ReadinessState::Exited);
                error!("Melotts process exited before initialization was complete");
                Err(SupervisorError::ExitedBeforeReady)
            }
            Ok(Err(e)) => {
                self.set_state(ReadinessState::Exited);
                Err(e.into())
            }
            Err(_) => {
                error!("Melotts process not ready after {:?}", limit);
                Err(SupervisorError::ReadyTimeout(limit))
            }
        }
    }

    /// Non-blocking check that the child has not exited.
    pub fn is_alive(&self) -> bool {
        match lock(&self.child).try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("melotts process exited with {}", status);
                false
            }
            Err(e) => {
                warn!("Failed to poll melotts process: {}", e);
                false
            }
        }
    }

    pub fn state(&self) -> ReadinessState {
        *lock(&self.state)
    }

    /// Ask the child to exit. Safe to call more than once.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ReadinessState::Exited);

        let mut child = lock(&self.child);
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} already exited with {}", self.program, status);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to poll {} before terminating: {}", self.program, e),
        }

        if let Some(pid) = child.id() {
            if send_sigterm(pid) {
                info!("Sent SIGTERM to {} (pid {})", self.program, pid);
                return;
            }
        }
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill {}: {}", self.program, e);
        }
    }

    fn set_state(&self, next: ReadinessState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("melotts readiness {} -> {}", *state, next);
            *state = next;
        }
    }
}

impl Liveness for Supervisor {
    fn readiness(&self) -> ReadinessState {
        let current = self.state();
        if current == ReadinessState::Ready && !self.is_alive() {
            error!("melotts process is no longer running");
            self.set_state(ReadinessState::Exited);
            return ReadinessState::Exited;
        }
        current
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(
            "SIGTERM to pid {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
    rc == 0
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}
