use std::path::PathBuf;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::SynthesisError;
use crate::protocol::Verdict;
use crate::queue::{Job, JobQueue};

/// Submits jobs and waits for their verdicts.
#[derive(Debug, Clone)]
pub struct SynthesisBridge {
    queue: JobQueue,
}

impl SynthesisBridge {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Enqueue one job and wait until the worker delivers its verdict.
    pub async fn submit(&self, sentence: impl Into<String>, output_path: impl Into<PathBuf>) -> Verdict {
        let (reply, verdict) = oneshot::channel();
        let job = Job {
            sentence: sentence.into(),
            output_path: output_path.into(),
            reply,
        };
        if let Err(e) = self.queue.enqueue(job) {
            return Verdict::Failure(e);
        }

        debug!("Request waiting for synthesis to complete...");
        let verdict = verdict
            .await
            .unwrap_or(Verdict::Failure(SynthesisError::WorkerGone));
        debug!("Request received result: {}", verdict.is_success());
        verdict
    }
}
