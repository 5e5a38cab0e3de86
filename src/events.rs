use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a per-operation event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Advisory only; the update continues unaffected.
    Warning,
    /// The operation landed in the failure ledger.
    Failed,
    /// The repair pass rebuilt this path from a complete install.
    Fixed,
    /// The repair pass could not rebuild this path.
    NonRecoverable,
}

/// Structured message from the update run back to its caller. Worker stages
/// never invoke caller code directly; everything crosses this channel.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Fractions of total chain bytes that have passed each stage.
    Progress {
        checked: f64,
        downloaded: f64,
        applied: f64,
    },
    Operation {
        path: String,
        kind: EventKind,
        detail: String,
    },
}

/// Sender side of the event channel; silently drops events once the receiver
/// is gone.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<UpdateEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<UpdateEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn send(&self, event: UpdateEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }

    pub fn operation(&self, path: &str, kind: EventKind, detail: impl Into<String>) {
        self.send(UpdateEvent::Operation {
            path: path.to_string(),
            kind,
            detail: detail.into(),
        });
    }
}

/// Byte counters across the whole package chain, one per pipeline stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressCounters {
    pub total: u64,
    pub checked: u64,
    pub downloaded: u64,
    pub applied: u64,
}

impl ProgressCounters {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    fn fraction(&self, value: u64) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            value as f64 / self.total as f64
        }
    }

    pub fn emit(&self, events: &EventSink) {
        events.send(UpdateEvent::Progress {
            checked: self.fraction(self.checked),
            downloaded: self.fraction(self.downloaded),
            applied: self.fraction(self.applied),
        });
    }
}

/// Cooperative cancellation flag, checked at package boundaries and before
/// each network request. Mid-package abort is not a defined operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fractions() {
        let mut counters = ProgressCounters::new(200);
        counters.checked = 50;
        counters.downloaded = 100;
        assert!((counters.fraction(counters.checked) - 0.25).abs() < f64::EPSILON);
        assert!((counters.fraction(counters.downloaded) - 0.5).abs() < f64::EPSILON);
        // An all-metadata chain (zero data bytes) is complete by definition.
        let empty = ProgressCounters::new(0);
        assert_eq!(empty.fraction(empty.applied), 1.0);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_event_sink_without_receiver_is_silent() {
        let sink = EventSink::default();
        sink.operation("a", EventKind::Warning, "no receiver attached");
    }
}
