//! Single-consumer job queue in front of the synthesis process.
//!
//! Any number of callers may enqueue; exactly one worker task owns the
//! child's streams and runs each job to completion before taking the next.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SynthesisError;
use crate::protocol::{Conversation, Stalled, SynthesisDriver, Verdict};
use crate::supervisor::{Liveness, ReadinessState};

/// One caller's request plus the slot its verdict is delivered through.
#[derive(Debug)]
pub struct Job {
    pub sentence: String,
    pub output_path: PathBuf,
    pub reply: oneshot::Sender<Verdict>,
}

/// Cloneable producer side of the queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    /// Never blocks. Fails only once the worker has stopped.
    pub fn enqueue(&self, job: Job) -> Result<(), SynthesisError> {
        self.tx.send(job).map_err(|_| SynthesisError::WorkerGone)
    }
}

struct Worker<W, R> {
    jobs: mpsc::UnboundedReceiver<Job>,
    conversation: Conversation<W, R>,
    driver: SynthesisDriver,
    liveness: Arc<dyn Liveness>,
    /// Set after a timeout until the child is back at its sentence prompt.
    stalled: Option<Stalled>,
}

impl<W, R> Worker<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            debug!("Worker processing request: sentence={:?}", job.sentence);
            let verdict = self.process(&job).await;
            if job.reply.send(verdict).is_err() {
                debug!("Caller for {} went away before the result", job.output_path.display());
            }
        }
        info!("Job queue closed; synthesis worker exiting");
    }

    async fn process(&mut self, job: &Job) -> Verdict {
        let state = self.liveness.readiness();
        if state != ReadinessState::Ready {
            warn!("melotts process is not running; cannot process request");
            return Verdict::Failure(SynthesisError::NotReady(state));
        }

        if let Some(mut stalled) = self.stalled.take() {
            match self.driver.resync(&mut self.conversation, &mut stalled).await {
                Ok(()) => {}
                Err(SynthesisError::TimedOut { .. }) => {
                    let stage = stalled.stage();
                    warn!("melotts process is still busy with an abandoned job ({})", stage);
                    self.stalled = Some(stalled);
                    return Verdict::Failure(SynthesisError::Unsynchronized { stage });
                }
                Err(e) => {
                    warn!("Failed to resynchronize with melotts process: {}", e);
                    return Verdict::Failure(e);
                }
            }
        }

        let verdict = self
            .driver
            .run(&mut self.conversation, &job.sentence, &job.output_path)
            .await;

        if let Verdict::Failure(SynthesisError::TimedOut { stage, .. }) = &verdict {
            self.stalled = Some(Stalled::new(*stage, job.output_path.clone()));
            let after = self.liveness.readiness();
            warn!("melotts process state after timeout: {}", after);
        }
        verdict
    }
}

/// Start the worker that owns `conversation`.
pub fn spawn_worker<W, R>(
    conversation: Conversation<W, R>,
    driver: SynthesisDriver,
    liveness: Arc<dyn Liveness>,
) -> (JobQueue, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, jobs) = mpsc::unbounded_channel();
    let worker = Worker {
        jobs,
        conversation,
        driver,
        liveness,
        stalled: None,
    };
    let handle = tokio::spawn(worker.run());
    (JobQueue { tx }, handle)
}
