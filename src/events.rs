//! Progress and status events emitted by the pipeline.
//!
//! The capture timer and the upload cycle report everything they do through
//! an [`EventSink`]; whoever holds the receiving end (the log observer in
//! `main`, a UI, a test) decides what to do with it. The pipeline never
//! reads anything back.

use tokio::sync::mpsc;

/// Which half of the pipeline an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    Capture,
    Upload,
}

impl EventScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventScope::Capture => "capture",
            EventScope::Upload => "upload",
        }
    }
}

/// A single outbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Human-readable status line.
    Message { scope: EventScope, message: String },
    /// Percentage progress of a long-running operation, 0..=100.
    Progress { scope: EventScope, percent: u8 },
}

/// Cloneable sending half of the event channel.
///
/// Sends are fire-and-forget: a dropped receiver must never fail the
/// pipeline, so send errors are swallowed.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl EventSink {
    /// Create a sink and the receiver an observer should drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn message(&self, scope: EventScope, message: impl Into<String>) {
        let _ = self.tx.send(PipelineEvent::Message {
            scope,
            message: message.into(),
        });
    }

    pub fn progress(&self, scope: EventScope, percent: u8) {
        let _ = self.tx.send(PipelineEvent::Progress { scope, percent });
    }
}

/// Per-operation progress dedupe.
///
/// Percentages within one assembly or upload operation must only be emitted
/// when they change and must never go backwards. Each operation constructs a
/// fresh gate.
#[derive(Debug, Default)]
pub struct ProgressGate {
    last: Option<u8>,
}

impl ProgressGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(percent)` when the value should be emitted.
    pub fn update(&mut self, percent: u8) -> Option<u8> {
        let percent = percent.min(100);
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_emits_only_on_change() {
        let mut gate = ProgressGate::new();
        assert_eq!(gate.update(0), Some(0));
        assert_eq!(gate.update(0), None);
        assert_eq!(gate.update(3), Some(3));
        assert_eq!(gate.update(3), None);
        assert_eq!(gate.update(100), Some(100));
        assert_eq!(gate.update(100), None);
    }

    #[test]
    fn gate_never_decreases() {
        let mut gate = ProgressGate::new();
        assert_eq!(gate.update(50), Some(50));
        assert_eq!(gate.update(49), None);
        assert_eq!(gate.update(50), None);
        assert_eq!(gate.update(51), Some(51));
    }

    #[test]
    fn gate_clamps_to_100() {
        let mut gate = ProgressGate::new();
        assert_eq!(gate.update(250), Some(100));
        assert_eq!(gate.update(100), None);
    }

    #[test]
    fn sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.message(EventScope::Capture, "started");
        sink.progress(EventScope::Upload, 10);

        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Message {
                scope: EventScope::Capture,
                message: "started".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Progress {
                scope: EventScope::Upload,
                percent: 10
            }
        );
    }

    #[test]
    fn sink_survives_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.message(EventScope::Upload, "nobody listening");
    }
}
