//! Streaming log reader.
//!
//! A run's response body arrives as arbitrary byte chunks. [`SseDecoder`] turns those
//! chunks into logical messages under one of two framings, [`drive_run`] feeds them to a
//! [`RunSink`] and stops at the first terminal phrase, and [`RunLog`] is the ordered,
//! append-only record the controllers keep for the UI.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use shared::domain::{LogEntry, LogKind, RunKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::ByteStream;

pub const STOPPED_MESSAGE: &str = "run stopped";
pub const TRAINING_COMPLETED_MESSAGE: &str = "training completed";

const TESTING_TERMINAL_PHRASES: &[&str] = &["총 결과는 이렇답니다~", "테스트가 완료되었습니다."];
const TRAINING_TERMINAL_PHRASES: &[&str] = &["학습이 완료되었습니다", "Training completed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One message per `data:` line; everything else is dropped.
    DataLines,
    /// Full event-stream assembly: consecutive `data:` lines form one message,
    /// dispatched on a blank line.
    EventStream,
}

#[derive(Debug)]
pub struct SseDecoder {
    framing: Framing,
    buffer: Vec<u8>,
    pending_data: Vec<String>,
}

impl SseDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            pending_data: Vec::new(),
        }
    }

    /// Feeds one chunk and returns every message completed by it, in arrival order.
    /// A line split across chunks is held until its newline arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.decode_line(line, &mut out);
        }
        out
    }

    /// Flushes an unterminated trailing line and any undispatched event at end of stream.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.decode_line(line, &mut out);
        }
        if !self.pending_data.is_empty() {
            out.push(self.pending_data.join("\n"));
            self.pending_data.clear();
        }
        out
    }

    fn decode_line(&mut self, line: &str, out: &mut Vec<String>) {
        match self.framing {
            Framing::DataLines => {
                if let Some(data) = line.strip_prefix("data:") {
                    out.push(data.trim().to_string());
                }
            }
            Framing::EventStream => {
                if line.is_empty() {
                    if !self.pending_data.is_empty() {
                        out.push(self.pending_data.join("\n"));
                        self.pending_data.clear();
                    }
                    return;
                }
                if line.starts_with(':') {
                    return;
                }
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                if field == "data" {
                    self.pending_data.push(value.to_string());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionEntry {
    /// The terminal line itself is logged as the completion entry.
    KeepLine,
    /// The terminal line is swapped for a fixed completion message.
    Replace(&'static str),
}

/// How one kind of run is fetched, framed, and recognized as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunProfile {
    pub kind: RunKind,
    pub framing: Framing,
    pub terminal_phrases: &'static [&'static str],
    pub completion: CompletionEntry,
}

impl RunProfile {
    pub fn for_kind(kind: RunKind) -> Self {
        match kind {
            RunKind::Testing => Self {
                kind,
                framing: Framing::EventStream,
                terminal_phrases: TESTING_TERMINAL_PHRASES,
                completion: CompletionEntry::KeepLine,
            },
            RunKind::Training => Self {
                kind,
                framing: Framing::DataLines,
                terminal_phrases: TRAINING_TERMINAL_PHRASES,
                completion: CompletionEntry::Replace(TRAINING_COMPLETED_MESSAGE),
            },
        }
    }

    /// Backend wording is not fixed, so any known phrase counts.
    pub fn is_terminal(&self, message: &str) -> bool {
        self.terminal_phrases
            .iter()
            .any(|phrase| message.contains(phrase))
    }

    pub fn completion_text(&self, terminal_line: &str) -> String {
        match self.completion {
            CompletionEntry::KeepLine => terminal_line.to_string(),
            CompletionEntry::Replace(text) => text.to_string(),
        }
    }
}

pub type RunId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Line(String),
    /// `entry` is `None` when the stream simply ended.
    Completed { entry: Option<String> },
    Failed(String),
}

#[async_trait]
pub trait RunSink: Send + Sync + 'static {
    async fn deliver(&self, run: RunId, event: RunEvent);
}

/// Delivers to `S` only while something else keeps it alive, so a reader task never
/// holds its controller.
pub struct WeakSink<S>(Weak<S>);

impl<S> WeakSink<S> {
    pub fn new(target: &Arc<S>) -> Self {
        Self(Arc::downgrade(target))
    }
}

#[async_trait]
impl<S: RunSink> RunSink for WeakSink<S> {
    async fn deliver(&self, run: RunId, event: RunEvent) {
        match self.0.upgrade() {
            Some(sink) => sink.deliver(run, event).await,
            None => debug!(run, "stream: sink is gone, dropping event"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
}

/// Reads `stream` to its first terminal event, delivering events in arrival order.
/// The stream is dropped on return, which releases the underlying connection.
pub async fn drive_run(
    id: RunId,
    mut stream: ByteStream,
    profile: RunProfile,
    sink: &dyn RunSink,
) -> RunOutcome {
    let mut decoder = SseDecoder::new(profile.framing);

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for message in decoder.push(&bytes) {
                    if deliver_message(id, &profile, sink, message).await {
                        info!(run = id, kind = ?profile.kind, "stream: terminal phrase received");
                        return RunOutcome::Completed;
                    }
                }
            }
            Err(err) => {
                warn!(run = id, error = %err, "stream: read failed");
                sink.deliver(id, RunEvent::Failed(err.to_string())).await;
                return RunOutcome::Failed;
            }
        }
    }

    for message in decoder.finish() {
        if deliver_message(id, &profile, sink, message).await {
            return RunOutcome::Completed;
        }
    }
    debug!(run = id, "stream: reached end of data");
    sink.deliver(id, RunEvent::Completed { entry: None }).await;
    RunOutcome::Completed
}

/// Returns true when `message` ended the run.
async fn deliver_message(
    id: RunId,
    profile: &RunProfile,
    sink: &dyn RunSink,
    message: String,
) -> bool {
    let message = message.trim();
    if message.is_empty() {
        return false;
    }
    if profile.is_terminal(message) {
        let entry = Some(profile.completion_text(message));
        sink.deliver(id, RunEvent::Completed { entry }).await;
        return true;
    }
    sink.deliver(id, RunEvent::Line(message.to_string())).await;
    false
}

/// Exclusive owner of one spawned run.
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn spawn(
        id: RunId,
        stream: ByteStream,
        profile: RunProfile,
        sink: Arc<dyn RunSink>,
    ) -> Self {
        let task = tokio::spawn(async move { drive_run(id, stream, profile, sink.as_ref()).await });
        Self { id, task }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Aborts the reader task; the stream it owns is dropped with it.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Idle,
    Active,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }
}

/// Ordered log of one run. Appends only happen while the run is active, so every
/// terminal transition is idempotent.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    status: RunStatus,
    entries: Vec<LogEntry>,
}

impl RunLog {
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn begin(&mut self) {
        self.entries.clear();
        self.status = RunStatus::Active;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.status = RunStatus::Idle;
    }

    pub fn append_line(&mut self, text: &str) -> bool {
        let text = text.trim();
        if !self.is_active() || text.is_empty() {
            return false;
        }
        self.entries.push(LogEntry::line(text));
        true
    }

    pub fn complete(&mut self, entry: Option<&str>) -> bool {
        if !self.is_active() {
            return false;
        }
        if let Some(text) = entry.map(str::trim).filter(|t| !t.is_empty()) {
            self.entries.push(LogEntry::new(LogKind::Completed, text));
        }
        self.status = RunStatus::Completed;
        true
    }

    pub fn fail(&mut self, reason: &str) -> bool {
        if !self.is_active() {
            return false;
        }
        self.entries.push(LogEntry::new(
            LogKind::Error,
            format!("connection to the server failed: {reason}"),
        ));
        self.status = RunStatus::Failed;
        true
    }

    pub fn stop(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.entries.push(LogEntry::new(LogKind::Stopped, STOPPED_MESSAGE));
        self.status = RunStatus::Stopped;
        true
    }

    /// Applies a reader event; returns whether anything changed.
    pub fn apply(&mut self, event: &RunEvent) -> bool {
        match event {
            RunEvent::Line(text) => self.append_line(text),
            RunEvent::Completed { entry } => self.complete(entry.as_deref()),
            RunEvent::Failed(reason) => self.fail(reason),
        }
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
