//! Lifecycle events emitted by the copy engine and the verifier.
//!
//! Events are delivered to a callback supplied by the caller for the duration
//! of one operation. There is no shared event bus.

use tokio::sync::mpsc;

/// Payload shared by every event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDetail {
    /// Short name of the phase, e.g. "SendData Start".
    pub label: String,
    /// Human-readable description including the file being transferred.
    pub message: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Start(EventDetail),
    Progress(EventDetail),
    Complete(EventDetail),
}

pub(crate) const START_LABEL: &str = "SendData Start";
pub(crate) const COMPLETE_LABEL: &str = "SendData Completed";

impl TransferEvent {
    pub(crate) fn start(message: &str, bytes_done: u64, bytes_total: u64) -> Self {
        TransferEvent::Start(EventDetail::new(START_LABEL, message, bytes_done, bytes_total))
    }

    pub(crate) fn progress(message: &str, bytes_done: u64, bytes_total: u64) -> Self {
        TransferEvent::Progress(EventDetail::new(START_LABEL, message, bytes_done, bytes_total))
    }

    pub(crate) fn complete(message: &str, bytes_done: u64, bytes_total: u64) -> Self {
        TransferEvent::Complete(EventDetail::new(
            COMPLETE_LABEL,
            message,
            bytes_done,
            bytes_total,
        ))
    }

    pub fn detail(&self) -> &EventDetail {
        match self {
            TransferEvent::Start(d) | TransferEvent::Progress(d) | TransferEvent::Complete(d) => d,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, TransferEvent::Complete(_))
    }

    /// Completion in percent, 100 when there is nothing to transfer.
    pub fn percentage(&self) -> u8 {
        let d = self.detail();
        if d.bytes_total == 0 {
            return 100;
        }
        ((d.bytes_done.min(d.bytes_total) as f64 / d.bytes_total as f64) * 100.0) as u8
    }
}

impl EventDetail {
    fn new(label: &str, message: &str, bytes_done: u64, bytes_total: u64) -> Self {
        Self {
            label: label.to_string(),
            message: message.to_string(),
            bytes_done,
            bytes_total,
        }
    }
}

/// Adapt an unbounded channel into an event callback.
///
/// Sending never blocks, so the callback is safe to use from the blocking
/// copy loop. Events are dropped once the receiver has gone away.
pub fn forward_to(tx: mpsc::UnboundedSender<TransferEvent>) -> impl FnMut(TransferEvent) {
    move |event| {
        let _ = tx.send(event);
    }
}
