use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::Poll;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Result of [`LineReader::read_until`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// True when the marker was seen before end of stream.
    pub matched: bool,
    /// Every line consumed, including the matching one.
    pub lines: Vec<String>,
}

enum Chunk {
    Line(String),
    Fragment,
    Eof,
}

/// Line-at-a-time reader over one of the child's output streams.
///
/// Bytes of an unfinished line are kept in the reader itself, so a read that
/// is cancelled by a timeout loses nothing.
pub struct LineReader<R> {
    inner: R,
    label: &'static str,
    pending: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R, label: &'static str) -> Self {
        Self {
            inner,
            label,
            pending: Vec::new(),
        }
    }

    /// Next newline-terminated line with the terminator (and any `\r`) removed.
    ///
    /// Returns `Ok(None)` at end of stream. An unterminated trailing fragment
    /// is discarded rather than returned.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            match self.fill_pending().await? {
                Chunk::Line(line) => return Ok(Some(line)),
                Chunk::Fragment => continue,
                Chunk::Eof => {
                    self.discard_fragment();
                    return Ok(None);
                }
            }
        }
    }

    /// Consume output until a line containing `marker` is seen or the stream ends.
    ///
    /// `observe` is called with every complete line, the matching one included.
    /// The child prints its prompts without a newline and then blocks on
    /// stdin, so an unfinished line also matches once the stream has nothing
    /// more to give. At end of stream an unfinished line never matches.
    pub async fn read_until<F>(&mut self, marker: &str, mut observe: F) -> io::Result<ReadOutcome>
    where
        F: FnMut(&str),
    {
        let mut outcome = ReadOutcome::default();
        if self.take_prompt(marker, &mut outcome).await? {
            return Ok(outcome);
        }
        loop {
            match self.fill_pending().await? {
                Chunk::Line(line) => {
                    debug!("[{}]: {}", self.label, line.trim());
                    observe(&line);
                    let hit = line.contains(marker);
                    outcome.lines.push(line);
                    if hit {
                        outcome.matched = true;
                        return Ok(outcome);
                    }
                }
                Chunk::Fragment => {
                    if self.take_prompt(marker, &mut outcome).await? {
                        return Ok(outcome);
                    }
                }
                Chunk::Eof => {
                    self.discard_fragment();
                    return Ok(outcome);
                }
            }
        }
    }

    /// Move buffered bytes into `pending`, up to and including one newline.
    async fn fill_pending(&mut self) -> io::Result<Chunk> {
        let (complete, used) = {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(Chunk::Eof);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.pending.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    self.pending.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        self.inner.consume(used);
        if !complete {
            return Ok(Chunk::Fragment);
        }

        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        Ok(Chunk::Line(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Accept the unfinished line as a prompt if it holds `marker` and the
    /// child has stopped writing.
    async fn take_prompt(&mut self, marker: &str, outcome: &mut ReadOutcome) -> io::Result<bool> {
        if self.pending.is_empty() || !self.stalled().await? {
            return Ok(false);
        }
        let fragment = String::from_utf8_lossy(&self.pending).into_owned();
        if !fragment.contains(marker) {
            return Ok(false);
        }
        debug!("[{}]: {} (awaiting input)", self.label, fragment.trim());
        self.pending.clear();
        outcome.lines.push(fragment);
        outcome.matched = true;
        Ok(true)
    }

    /// True when no more output is available right now and the stream is open.
    async fn stalled(&mut self) -> io::Result<bool> {
        let inner = &mut self.inner;
        poll_fn(|cx| match Pin::new(&mut *inner).poll_fill_buf(cx) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(false)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Ready(Ok(true)),
        })
        .await
    }

    fn discard_fragment(&mut self) {
        if !self.pending.is_empty() {
            trace!(
                "[{}]: dropping unterminated fragment at end of stream: {:?}",
                self.label,
                String::from_utf8_lossy(&self.pending)
            );
            self.pending.clear();
        }
    }
}

/// Forward every line of `stream` to the log until it closes.
///
/// Fire-and-forget: the handle is never joined and a read error simply ends
/// the task.
pub fn spawn_drain<R>(stream: R, label: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = LineReader::new(BufReader::new(stream), label);
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => warn!("[{}]: {}", label, line.trim()),
                Ok(None) => break,
                Err(e) => {
                    debug!("[{}]: stream closed with error: {}", label, e);
                    break;
                }
            }
        }
        debug!("[{}]: drain finished", label);
    })
}
