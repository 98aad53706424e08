// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host-attributed command output
//!
//! Every running command has two drains, one per output stream, reading
//! lines until the stream closes. Lines are tagged with the owning host and
//! written through one shared [`OutputSink`] a whole line at a time, so
//! concurrent hosts never interleave mid-line. Terminal sinks hand lines to
//! a dedicated writer thread; a slow reader on the other end of stdout then
//! backs up that thread instead of the async workers.

use std::io::Write;
use std::sync::{Arc, Mutex};

use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::FlockError;

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

enum SinkMessage {
    Line(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
enum SinkTarget {
    /// Written in the caller under a lock
    Direct(Arc<Mutex<Box<dyn Write + Send>>>),
    /// Queued for the writer thread
    Queued(mpsc::UnboundedSender<SinkMessage>),
}

/// Serialized, line-oriented writer shared by every drain in a run
#[derive(Clone)]
pub struct OutputSink {
    target: SinkTarget,
    color: bool,
}

impl OutputSink {
    /// Sink writing to the process's stdout from a writer thread
    pub fn stdout(color: bool) -> Self {
        Self::spawn_writer(std::io::stdout(), color).unwrap_or_else(|e| {
            warn!(error = %e, "Couldn't start output writer thread; writing inline");
            Self::from_writer(std::io::stdout(), color)
        })
    }

    /// Sink writing to the process's stderr from a writer thread
    pub fn stderr(color: bool) -> Self {
        Self::spawn_writer(std::io::stderr(), color).unwrap_or_else(|e| {
            warn!(error = %e, "Couldn't start output writer thread; writing inline");
            Self::from_writer(std::io::stderr(), color)
        })
    }

    /// Sink whose writes happen on a dedicated thread owning `writer`.
    ///
    /// Lines are queued without bound; call [`OutputSink::flush`] before
    /// relying on everything having been written.
    pub fn spawn_writer<W: Write + Send + 'static>(writer: W, color: bool) -> std::io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<SinkMessage>();
        std::thread::Builder::new()
            .name("flock-output".to_string())
            .spawn(move || {
                let mut writer = writer;
                while let Some(message) = receiver.blocking_recv() {
                    match message {
                        SinkMessage::Line(text) => {
                            let _ = writeln!(writer, "{}", text).and_then(|_| writer.flush());
                        }
                        SinkMessage::Flush(done) => {
                            let _ = writer.flush();
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(Self {
            target: SinkTarget::Queued(sender),
            color,
        })
    }

    /// Sink writing inline, in the calling task
    pub fn from_writer<W: Write + Send + 'static>(writer: W, color: bool) -> Self {
        Self {
            target: SinkTarget::Direct(Arc::new(Mutex::new(Box::new(writer)))),
            color,
        }
    }

    /// Uncolored sink capturing everything in memory
    pub fn memory() -> (Self, MemoryBuffer) {
        let buffer = MemoryBuffer::default();
        (Self::from_writer(buffer.clone(), false), buffer)
    }

    /// Write one attributed output line
    pub fn emit(&self, host: &str, stream: StreamKind, attempt: u32, text: &str) {
        let tag = match stream {
            StreamKind::Stdout => format!("{}:", host),
            StreamKind::Stderr if attempt > 1 => {
                format!("{} ({} attempt):", host, ordinal(attempt))
            }
            StreamKind::Stderr => format!("{}:", host),
        };
        let tag = match (self.color, stream) {
            (false, _) => tag,
            (true, StreamKind::Stdout) => tag.cyan().to_string(),
            (true, StreamKind::Stderr) => tag.red().to_string(),
        };
        self.line(&format!("{} {}", tag, text));
    }

    /// Write a complete line
    pub fn line(&self, text: &str) {
        match &self.target {
            SinkTarget::Direct(writer) => {
                let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let _ = writeln!(writer, "{}", text).and_then(|_| writer.flush());
            }
            SinkTarget::Queued(sender) => {
                let _ = sender.send(SinkMessage::Line(text.to_string()));
            }
        }
    }

    /// Wait until every line written so far reached the underlying writer
    pub async fn flush(&self) {
        match &self.target {
            SinkTarget::Direct(writer) => {
                let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let _ = writer.flush();
            }
            SinkTarget::Queued(sender) => {
                let (done, written) = oneshot::channel();
                if sender.send(SinkMessage::Flush(done)).is_ok() {
                    let _ = written.await;
                }
            }
        }
    }

    pub fn is_colored(&self) -> bool {
        self.color
    }
}

/// In-memory capture target for [`OutputSink::memory`]
#[derive(Clone, Default)]
pub struct MemoryBuffer(Arc<Mutex<Vec<u8>>>);

impl MemoryBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&bytes).to_string()
    }
}

impl Write for MemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut bytes = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// "1st", "2nd", "3rd", "4th", ..., "11th", "12th", "13th", "21st"
pub fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

/// Lines written by each drain of one command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub stdout_lines: usize,
    pub stderr_lines: usize,
}

/// Drain one stream to the sink until it closes.
///
/// A read failure is logged once and ends the drain; it does not fail the
/// command. Invalid UTF-8 is written lossily.
pub async fn drain_stream<R>(
    reader: R,
    host: &str,
    stream: StreamKind,
    attempt: u32,
    sink: &OutputSink,
    cancel: &CancellationToken,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0;

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                sink.emit(host, stream, attempt, text.trim_end_matches(|c: char| c == '\n' || c == '\r'));
                lines += 1;
            }
            Err(source) => {
                let err = FlockError::StreamRead {
                    host: host.to_string(),
                    stream: stream.as_str(),
                    source,
                };
                warn!(host = %host, error = %err, "Error reading output from this host");
                break;
            }
        }
    }

    lines
}

/// Drain both streams of a command concurrently; returns once both closed
pub async fn drain_command<O, E>(
    host: &str,
    attempt: u32,
    stdout: O,
    stderr: E,
    sink: &OutputSink,
    cancel: &CancellationToken,
) -> DrainReport
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let (stdout_lines, stderr_lines) = tokio::join!(
        drain_stream(stdout, host, StreamKind::Stdout, attempt, sink, cancel),
        drain_stream(stderr, host, StreamKind::Stderr, attempt, sink, cancel),
    );
    DrainReport {
        stdout_lines,
        stderr_lines,
    }
}
