//! Structured progress event stream.
//!
//! Every externally visible step of a run emits `ProgressEvent`s through a
//! `ProgressSink`. Consumers subscribe with a `ChannelSink` (CLI rendering,
//! tests) or discard events with `NoOpSink`. Events carry a monotonic
//! sequence number so interleaved phase output can be ordered downstream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Phase of a run an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Query,
    Search,
    Synthesize,
    Review,
    Refine,
    Finalize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Query => "query",
            Phase::Search => "search",
            Phase::Synthesize => "synthesize",
            Phase::Review => "review",
            Phase::Refine => "refine",
            Phase::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an event within its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Start,
    Progress,
    End,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Start => "start",
            Status::Progress => "progress",
            Status::End => "end",
            Status::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress event. `seq` is strictly increasing within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub phase: Phase,
    pub status: Status,
    pub payload: Value,
}

/// Receives progress events. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Sink that discards all events.
pub struct NoOpSink;

impl ProgressSink for NoOpSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Sink that forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    /// Create a sink together with the stream of events it will produce.
    pub fn pair() -> (Self, UnboundedReceiverStream<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // The consumer may have stopped listening; events are best-effort.
        let _ = self.tx.send(event);
    }
}

/// Stamps events with sequence numbers and hands out phase spans.
pub struct ProgressEmitter {
    sink: Arc<dyn ProgressSink>,
    seq: AtomicU64,
}

impl ProgressEmitter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            seq: AtomicU64::new(0),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoOpSink))
    }

    pub fn emit(&self, phase: Phase, status: Status, payload: Value) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.emit(ProgressEvent {
            seq,
            phase,
            status,
            payload,
        });
    }

    /// Open a phase span. The start event is emitted immediately; the span
    /// guarantees a matching end or error event when it is closed or dropped.
    pub fn phase_span(&self, phase: Phase, payload: Value) -> PhaseSpan<'_> {
        self.emit(phase, Status::Start, payload);
        PhaseSpan {
            emitter: self,
            phase,
            finished: false,
        }
    }
}

/// In-flight phase. Dropping without `end` or `fail` emits an error event
/// so start events are never left unpaired.
pub struct PhaseSpan<'a> {
    emitter: &'a ProgressEmitter,
    phase: Phase,
    finished: bool,
}

impl PhaseSpan<'_> {
    pub fn progress(&self, payload: Value) {
        self.emitter.emit(self.phase, Status::Progress, payload);
    }

    pub fn end(mut self, payload: Value) {
        self.finished = true;
        self.emitter.emit(self.phase, Status::End, payload);
    }

    pub fn fail(mut self, payload: Value) {
        self.finished = true;
        self.emitter.emit(self.phase, Status::Error, payload);
    }
}

impl Drop for PhaseSpan<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.emitter.emit(
                self.phase,
                Status::Error,
                serde_json::json!({ "message": "phase abandoned" }),
            );
        }
    }
}
