use async_trait::async_trait;
use std::sync::Mutex;

/// A single session lifecycle event as written to the (out-of-scope)
/// persistent log store. The core never depends on the store directly —
/// only on this seam — so the persistence layer (SQLite, per §1) can be
/// swapped in without touching C1-C5.
#[derive(Debug, Clone)]
pub struct SessionLogEvent {
    pub session_id: String,
    pub anon_ip: String,
    pub url: String,
    pub kind: SessionLogKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLogKind {
    Started,
    Ended { reason: String, duration_secs: u64 },
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn record(&self, event: SessionLogEvent);
}

/// Default sink: the persistent log store is out of scope (§1), so
/// production wiring without one configured simply drops events.
#[derive(Debug, Default)]
pub struct NullLogSink;

#[async_trait]
impl LogSink for NullLogSink {
    async fn record(&self, _event: SessionLogEvent) {}
}

/// In-memory sink used by tests to assert on what would have been logged.
#[derive(Debug, Default)]
pub struct RecordingLogSink {
    events: Mutex<Vec<SessionLogEvent>>,
}

#[async_trait]
impl LogSink for RecordingLogSink {
    async fn record(&self, event: SessionLogEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingLogSink {
    pub fn events(&self) -> Vec<SessionLogEvent> {
        self.events.lock().unwrap().clone()
    }
}
