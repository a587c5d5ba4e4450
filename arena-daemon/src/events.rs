//! Optional event sink for reconciliation outcomes.

use std::fmt;

use arena_core::conditions::Reason;
use arena_core::types::SourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// Receives one event per error transition and per successful sync.
/// Recording must not fail the reconciliation, so it returns nothing.
pub trait EventRecorder: Send + Sync {
    fn record(&self, key: &SourceKey, event_type: EventType, reason: Reason, message: &str);
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn record(&self, key: &SourceKey, event_type: EventType, reason: Reason, message: &str) {
        match event_type {
            EventType::Normal => {
                tracing::info!(source = %key, %reason, "{message}");
            }
            EventType::Warning => {
                tracing::warn!(source = %key, %reason, "{message}");
            }
        }
    }
}
