use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ConnAccepted,
    ConnTranslated,
    TranslateFailed,
    ListenerAdded,
    ListenerRemoved,
    ListenerClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateEvent {
    pub kind: EventKind,
    pub conn_id: Option<u64>,
    pub detail: String,
}

impl TranslateEvent {
    pub fn new(kind: EventKind, conn_id: Option<u64>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            conn_id,
            detail: detail.into(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TranslateEvent);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: TranslateEvent) {}
}

#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<TranslateEvent>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<TranslateEvent> {
        self.events.lock().expect("event sink lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: TranslateEvent) {
        self.events
            .lock()
            .expect("event sink lock poisoned")
            .push(event);
    }
}
