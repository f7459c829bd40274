//! In-memory [`AuditSink`] that keeps every recorded event.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{AuditEvent, AuditSink};

#[derive(Default)]
pub(crate) struct RecordingAuditSink {
    events: Mutex<Vec<(DateTime<Utc>, AuditEvent)>>,
}

impl RecordingAuditSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub(crate) fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.kind())
            .collect()
    }

    pub(crate) fn recorded_at(&self) -> Vec<DateTime<Utc>> {
        self.events.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: &AuditEvent, at: DateTime<Utc>) {
        self.events.lock().unwrap().push((at, event.clone()));
    }
}
