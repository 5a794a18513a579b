//! Per-job conversation with the interactive synthesis process.
//!
//! The child prints `Enter a sentence` when it is idle, `Enter the output wav
//! file path` once it has read a sentence, and `Saved audio to <path>` after
//! writing the wav file, followed by the next `Enter a sentence` prompt. A job
//! succeeds only when both completion markers are seen.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::SynthesisError;
use crate::reader::{LineReader, ReadOutcome};

pub const READY_MARKER: &str = "Enter a sentence";
pub const PATH_PROMPT_MARKER: &str = "Enter the output wav file path";
pub const SAVED_MARKER: &str = "Saved audio to";

const SYNTHESIS_FINISHED_DEBUG: &str = "[DEBUG] do_synthesize finished.";
const LOOP_RESTARTED_DEBUG: &str = "[DEBUG] Top of interactive loop.";

static SAVED_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{}\s+(.+?)\s*$", regex::escape(SAVED_MARKER))).expect("valid regex")
});

/// Where a job was in the exchange when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SendingSentence,
    AwaitingPathPrompt,
    SendingPath,
    AwaitingCompletion,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Stage::SendingSentence => "sending the sentence",
            Stage::AwaitingPathPrompt => "waiting for the output path prompt",
            Stage::SendingPath => "sending the output path",
            Stage::AwaitingCompletion => "waiting for synthesis to complete",
        };
        f.write_str(text)
    }
}

/// Outcome delivered to the caller of exactly one job.
#[derive(Debug)]
pub enum Verdict {
    Success,
    Failure(SynthesisError),
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }

    /// Diagnostic text for a failure.
    pub fn reason(&self) -> Option<String> {
        match self {
            Verdict::Success => None,
            Verdict::Failure(e) => Some(e.to_string()),
        }
    }
}

impl From<Result<(), SynthesisError>> for Verdict {
    fn from(result: Result<(), SynthesisError>) -> Self {
        match result {
            Ok(()) => Verdict::Success,
            Err(e) => Verdict::Failure(e),
        }
    }
}

/// The child's stdin together with a line reader over its stdout.
pub struct Conversation<W, R> {
    pub stdin: W,
    pub stdout: LineReader<R>,
}

impl<W, R> Conversation<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    pub fn new(stdin: W, stdout: LineReader<R>) -> Self {
        Self { stdin, stdout }
    }

    async fn send_line(&mut self, text: &str, trailing_blank: bool) -> std::io::Result<()> {
        let mut payload = single_line(text);
        payload.push('\n');
        if trailing_blank {
            payload.push('\n');
        }
        self.stdin.write_all(payload.as_bytes()).await?;
        self.stdin.flush().await
    }
}

/// Tunables for [`SynthesisDriver`].
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    /// Pause between seeing the path prompt and writing the path.
    pub settle_delay: Duration,
    /// Upper bound on each wait for a marker; `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Send a blank line after the output path.
    pub trailing_blank_line: bool,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            read_timeout: Some(Duration::from_secs(60)),
            trailing_blank_line: true,
        }
    }
}

/// A job whose caller already got [`SynthesisError::TimedOut`] but whose
/// exchange the child may still be carrying out.
#[derive(Debug, Clone)]
pub struct Stalled {
    stage: Stage,
    output_path: PathBuf,
}

impl Stalled {
    pub fn new(stage: Stage, output_path: PathBuf) -> Self {
        Self { stage, output_path }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }
}

/// Drives one job through sentence, path prompt, path and completion.
#[derive(Debug, Clone, Default)]
pub struct SynthesisDriver {
    settings: ProtocolSettings,
}

impl SynthesisDriver {
    pub fn new(settings: ProtocolSettings) -> Self {
        Self { settings }
    }

    pub async fn run<W, R>(
        &self,
        conversation: &mut Conversation<W, R>,
        sentence: &str,
        output_path: &Path,
    ) -> Verdict
    where
        W: AsyncWrite + Unpin,
        R: AsyncBufRead + Unpin,
    {
        let verdict: Verdict = self.exchange(conversation, sentence, output_path).await.into();
        match &verdict {
            Verdict::Success => info!("Synthesized {}", output_path.display()),
            Verdict::Failure(e) => warn!("Synthesis of {} failed: {}", output_path.display(), e),
        }
        verdict
    }

    /// Finish the exchange of a timed-out job so the child is back at its
    /// sentence prompt.
    ///
    /// A child still waiting for the path gets the abandoned job's path. On
    /// [`SynthesisError::TimedOut`] `stalled` records how far it got and the
    /// call can be repeated.
    pub async fn resync<W, R>(
        &self,
        conversation: &mut Conversation<W, R>,
        stalled: &mut Stalled,
    ) -> Result<(), SynthesisError>
    where
        W: AsyncWrite + Unpin,
        R: AsyncBufRead + Unpin,
    {
        debug!(
            "Resynchronizing after abandoned job {} ({})",
            stalled.output_path.display(),
            stalled.stage
        );
        if matches!(stalled.stage, Stage::SendingSentence | Stage::AwaitingPathPrompt) {
            let prompt = self
                .await_marker(conversation, Stage::AwaitingPathPrompt, PATH_PROMPT_MARKER, |_| {})
                .await?;
            if !prompt.matched {
                return Err(SynthesisError::Desync(Stage::AwaitingPathPrompt));
            }
            self.settle().await;
            conversation
                .send_line(
                    &stalled.output_path.to_string_lossy(),
                    self.settings.trailing_blank_line,
                )
                .await?;
            stalled.stage = Stage::AwaitingCompletion;
        }

        let ready = self
            .await_marker(conversation, Stage::AwaitingCompletion, READY_MARKER, |_| {})
            .await?;
        if !ready.matched {
            return Err(SynthesisError::Desync(Stage::AwaitingCompletion));
        }
        info!("Synthesis process caught up with {}", stalled.output_path.display());
        Ok(())
    }

    async fn exchange<W, R>(
        &self,
        conversation: &mut Conversation<W, R>,
        sentence: &str,
        output_path: &Path,
    ) -> Result<(), SynthesisError>
    where
        W: AsyncWrite + Unpin,
        R: AsyncBufRead + Unpin,
    {
        debug!("{}: {:?}", Stage::SendingSentence, sentence);
        conversation.send_line(sentence, false).await?;

        let prompt = self
            .await_marker(conversation, Stage::AwaitingPathPrompt, PATH_PROMPT_MARKER, |_| {})
            .await?;
        if !prompt.matched {
            return Err(SynthesisError::Desync(Stage::AwaitingPathPrompt));
        }

        self.settle().await;

        let path = single_line(&output_path.to_string_lossy());
        debug!("{}: {}", Stage::SendingPath, path);
        conversation
            .send_line(&path, self.settings.trailing_blank_line)
            .await?;

        let mut saved = false;
        let mut foreign = None;
        let completion = self
            .await_marker(conversation, Stage::AwaitingCompletion, READY_MARKER, |line| {
                if let Some(caps) = SAVED_PATH.captures(line) {
                    if caps[1] == *path.trim() {
                        saved = true;
                    } else {
                        foreign = Some(caps[1].to_string());
                    }
                }
                if line.contains(SYNTHESIS_FINISHED_DEBUG) {
                    debug!("Child reports synthesis finished");
                }
                if line.contains(LOOP_RESTARTED_DEBUG) {
                    debug!("Child interactive loop restarted");
                }
            })
            .await?;

        if let Some(reported) = foreign {
            return Err(SynthesisError::SavedPathMismatch {
                expected: path,
                reported,
            });
        }
        match (saved, completion.matched) {
            (true, true) => Ok(()),
            (false, false) => Err(SynthesisError::Desync(Stage::AwaitingCompletion)),
            (saved, prompt) => Err(SynthesisError::PartialCompletion { saved, prompt }),
        }
    }

    async fn settle(&self) {
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
    }

    async fn await_marker<W, R, F>(
        &self,
        conversation: &mut Conversation<W, R>,
        stage: Stage,
        marker: &str,
        observe: F,
    ) -> Result<ReadOutcome, SynthesisError>
    where
        R: AsyncBufRead + Unpin,
        F: FnMut(&str),
    {
        let read = conversation.stdout.read_until(marker, observe);
        let outcome = match self.settings.read_timeout {
            Some(after) => tokio::time::timeout(after, read)
                .await
                .map_err(|_| SynthesisError::TimedOut { stage, after })??,
            None => read.await?,
        };
        Ok(outcome)
    }
}

/// The child reads line by line, so embedded line breaks would split a job
/// across two prompts.
fn single_line(text: &str) -> String {
    text.split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream, duplex};
    use tokio::task::JoinHandle;

    type TestConversation = Conversation<DuplexStream, BufReader<DuplexStream>>;

    /// Returns the driver-side conversation plus the child's ends: the stream
    /// the child reads its stdin from and the stream it writes stdout to.
    fn fake_child() -> (TestConversation, DuplexStream, DuplexStream) {
        let (stdin, child_stdin) = duplex(8192);
        let (child_stdout, stdout) = duplex(8192);
        let conversation = Conversation::new(stdin, LineReader::new(BufReader::new(stdout), "test"));
        (conversation, child_stdin, child_stdout)
    }

    fn quick_driver() -> SynthesisDriver {
        SynthesisDriver::new(ProtocolSettings {
            settle_delay: Duration::ZERO,
            read_timeout: Some(Duration::from_secs(5)),
            trailing_blank_line: true,
        })
    }

    async fn written(conversation: TestConversation, mut child_stdin: DuplexStream) -> String {
        drop(conversation);
        let mut out = String::new();
        child_stdin.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_clean_exchange_succeeds() {
        let (mut conversation, child_stdin, mut child_stdout) = fake_child();
        child_stdout
            .write_all(
                b"Enter the output wav file path (e.g., output.wav): \n\
                  sentence: Hello world\n\
                  Saved audio to /tmp/out.wav\n\
                  Enter a sentence (or 'quit' to exit): \n",
            )
            .await
            .unwrap();

        let verdict = quick_driver()
            .run(&mut conversation, "Hello world", Path::new("/tmp/out.wav"))
            .await;

        assert!(verdict.is_success());
        assert_eq!(
            written(conversation, child_stdin).await,
            "Hello world\n/tmp/out.wav\n\n"
        );
    }

    #[tokio::test]
    async fn test_saved_without_prompt_is_partial() {
        let (mut conversation, child_stdin, mut child_stdout) = fake_child();
        child_stdout
            .write_all(b"Enter the output wav file path\nSaved audio to /tmp/out.wav\n")
            .await
            .unwrap();
        drop(child_stdout);

        let verdict = quick_driver()
            .run(&mut conversation, "Hello world", Path::new("/tmp/out.wav"))
            .await;

        assert!(matches!(
            verdict,
            Verdict::Failure(SynthesisError::PartialCompletion {
                saved: true,
                prompt: false
            })
        ));
        drop(child_stdin);
    }

    #[tokio::test]
    async fn test_prompt_without_save_is_partial() {
        let (mut conversation, _child_stdin, mut child_stdout) = fake_child();
        child_stdout
            .write_all(b"Enter the output wav file path\nSave audio file failed!\nEnter a sentence\n")
            .await
            .unwrap();

        let verdict = quick_driver()
            .run(&mut conversation, "Hello", Path::new("/tmp/out.wav"))
            .await;

        assert!(matches!(
            verdict,
            Verdict::Failure(SynthesisError::PartialCompletion {
                saved: false,
                prompt: true
            })
        ));
    }

    #[tokio::test]
    async fn test_end_of_stream_before_path_prompt_never_writes_path() {
        let (mut conversation, child_stdin, mut child_stdout) = fake_child();
        child_stdout.write_all(b"sentence: Hello\n").await.unwrap();
        drop(child_stdout);

        let verdict = quick_driver()
            .run(&mut conversation, "Hello", Path::new("/tmp/out.wav"))
            .await;

        assert!(matches!(
            verdict,
            Verdict::Failure(SynthesisError::Desync(Stage::AwaitingPathPrompt))
        ));
        assert_eq!(written(conversation, child_stdin).await, "Hello\n");
    }

    #[tokio::test]
    async fn test_end_of_stream_after_path_is_desync() {
        let (mut conversation, _child_stdin, mut child_stdout) = fake_child();
        child_stdout
            .write_all(b"Enter the output wav file path\n")
            .await
            .unwrap();
        drop(child_stdout);

        let verdict = quick_driver()
            .run(&mut conversation, "Hello", Path::new("/tmp/out.wav"))
            .await;

        assert!(matches!(
            verdict,
            Verdict::Failure(SynthesisError::Desync(Stage::AwaitingCompletion))
        ));
    }

    #[tokio::test]
    async fn test_silent_child_times_out() {
        let (mut conversation, _child_stdin, _child_stdout) = fake_child();
        let driver = SynthesisDriver::new(ProtocolSettings {
            settle_delay: Duration::ZERO,
            read_timeout: Some(Duration::from_millis(50)),
            trailing_blank_line: true,
        });

        let verdict = driver
            .run(&mut conversation, "Hello", Path::new("/tmp/out.wav"))
            .await;

        assert!(matches!(
            verdict,
            Verdict::Failure(SynthesisError::TimedOut {
                stage: Stage::AwaitingPathPrompt,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_write_to_closed_stdin_fails() {
        let (mut conversation, child_stdin, _child_stdout) = fake_child();
        drop(child_stdin);

        let verdict = quick_driver()
            .run(&mut conversation, "Hello", Path::new("/tmp/out.wav"))
            .await;

        assert!(matches!(verdict, Verdict::Failure(SynthesisError::Io(_))));
    }

    #[tokio::test]
    async fn test_without_trailing_blank_line() {
        let (mut conversation, child_stdin, mut child_stdout) = fake_child();
        child_stdout
            .write_all(b"Enter the output wav file path\nSaved audio to a.wav\nEnter a sentence\n")
            .await
            .unwrap();
        let driver = SynthesisDriver::new(ProtocolSettings {
            settle_delay: Duration::ZERO,
            read_timeout: None,
            trailing_blank_line: false,
        });

        let verdict = driver.run(&mut conversation, "Hi", Path::new("a.wav")).await;

        assert!(verdict.is_success());
        assert_eq!(written(conversation, child_stdin).await, "Hi\na.wav\n");
    }

    #[tokio::test]
    async fn test_saved_path_of_another_job_fails() {
        let (mut conversation, _child_stdin, mut child_stdout) = fake_child();
        child_stdout
            .write_all(
                b"Enter the output wav file path\n\
                  Saved audio to /tmp/old.wav\n\
                  Enter a sentence\n",
            )
            .await
            .unwrap();

        let verdict = quick_driver()
            .run(&mut conversation, "Hello", Path::new("/tmp/new.wav"))
            .await;

        match verdict {
            Verdict::Failure(SynthesisError::SavedPathMismatch { expected, reported }) => {
                assert_eq!(expected, "/tmp/new.wav");
                assert_eq!(reported, "/tmp/old.wav");
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    /// Plays the real binary's output: prompts end without a newline and the
    /// sentence prompt starts with one.
    fn interactive_child(child_stdin: DuplexStream, mut child_stdout: DuplexStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(child_stdin).lines();
            while let Ok(Some(sentence)) = lines.next_line().await {
                if sentence.is_empty() {
                    let _ = child_stdout
                        .write_all(b"\nEnter a sentence (or 'quit' to exit): ")
                        .await;
                    continue;
                }
                let _ = child_stdout
                    .write_all(b"Enter the output wav file path (e.g., output.wav): ")
                    .await;
                let Ok(Some(wav)) = lines.next_line().await else {
                    break;
                };
                let reply = format!(
                    "[DEBUG] do_synthesize finished.\nSaved audio to {wav}\n\nEnter a sentence (or 'quit' to exit): "
                );
                let _ = child_stdout.write_all(reply.as_bytes()).await;
            }
        })
    }

    #[tokio::test]
    async fn test_unterminated_prompts_complete_jobs() {
        let (mut conversation, child_stdin, child_stdout) = fake_child();
        let child = interactive_child(child_stdin, child_stdout);
        let driver = quick_driver();

        for path in ["/tmp/one.wav", "/tmp/two.wav", "/tmp/three.wav"] {
            let verdict = driver.run(&mut conversation, "Hello world", Path::new(path)).await;
            assert!(verdict.is_success(), "{path}: {:?}", verdict.reason());
        }

        drop(conversation);
        child.await.unwrap();
    }

    #[tokio::test]
    async fn test_resync_delivers_abandoned_path_and_waits_for_prompt() {
        let (mut conversation, child_stdin, mut child_stdout) = fake_child();
        let driver = quick_driver();
        let mut stalled = Stalled::new(Stage::AwaitingPathPrompt, PathBuf::from("/tmp/late.wav"));

        child_stdout
            .write_all(b"Enter the output wav file path (e.g., output.wav): ")
            .await
            .unwrap();
        let answer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child_stdout
                .write_all(b"Saved audio to /tmp/late.wav\n\nEnter a sentence (or 'quit' to exit): ")
                .await
                .unwrap();
            child_stdout
        });

        driver.resync(&mut conversation, &mut stalled).await.unwrap();
        assert_eq!(stalled.stage(), Stage::AwaitingCompletion);

        let _child_stdout = answer.await.unwrap();
        assert_eq!(
            written(conversation, child_stdin).await,
            "/tmp/late.wav\n\n"
        );
    }

    #[tokio::test]
    async fn test_resync_timeout_keeps_progress() {
        let (mut conversation, _child_stdin, mut child_stdout) = fake_child();
        let driver = SynthesisDriver::new(ProtocolSettings {
            settle_delay: Duration::ZERO,
            read_timeout: Some(Duration::from_millis(50)),
            trailing_blank_line: true,
        });
        let mut stalled = Stalled::new(Stage::AwaitingPathPrompt, PathBuf::from("/tmp/late.wav"));
        child_stdout
            .write_all(b"Enter the output wav file path\n")
            .await
            .unwrap();

        let result = driver.resync(&mut conversation, &mut stalled).await;

        assert!(matches!(
            result,
            Err(SynthesisError::TimedOut {
                stage: Stage::AwaitingCompletion,
                ..
            })
        ));
        assert_eq!(stalled.stage(), Stage::AwaitingCompletion);
    }

    #[test]
    fn test_single_line_collapses_breaks() {
        assert_eq!(single_line("one\ntwo\r\nthree"), "one two three");
        assert_eq!(single_line("plain"), "plain");
    }

    #[test]
    fn test_verdict_reason() {
        assert_eq!(Verdict::Success.reason(), None);
        let failure = Verdict::Failure(SynthesisError::Desync(Stage::AwaitingPathPrompt));
        assert_eq!(
            failure.reason().as_deref(),
            Some("Protocol desync: output ended while waiting for the output path prompt")
        );
    }
}
