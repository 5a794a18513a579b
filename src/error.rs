use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::Stage;
use crate::supervisor::ReadinessState;

/// Failures while launching or handshaking with the synthesis process.
///
/// Every variant is fatal at startup: the server must not begin serving.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("Failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Child {0} stream was not captured")]
    MissingStream(&'static str),

    #[error("Process exited before initialization was complete")]
    ExitedBeforeReady,

    #[error("Process not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-job failure reasons. None of these stop the worker.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("Synthesis process is not running (state: {0})")]
    NotReady(ReadinessState),

    #[error("Protocol desync: output ended while {0}")]
    Desync(Stage),

    #[error("Partial completion (saved: {saved}, prompt: {prompt})")]
    PartialCompletion { saved: bool, prompt: bool },

    #[error("Protocol desync: child saved {reported} but {expected} was requested")]
    SavedPathMismatch { expected: String, reported: String },

    #[error("Synthesis process has not finished an abandoned job (stuck {stage})")]
    Unsynchronized { stage: Stage },

    #[error("Timed out after {after:?} while {stage}")]
    TimedOut { stage: Stage, after: Duration },

    #[error("IO error talking to the synthesis process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Synthesis worker is no longer running")]
    WorkerGone,
}
