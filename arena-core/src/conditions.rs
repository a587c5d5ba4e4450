//! Condition bookkeeping for template source status.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::types::{Condition, ConditionStatus};

/// Overall readiness of a source.
pub const CONDITION_READY: &str = "Ready";
/// Whether a stored artifact backs the source.
pub const CONDITION_ARTIFACT_AVAILABLE: &str = "ArtifactAvailable";

/// Stable, enumerable reasons attached to conditions and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Suspended,
    ConfigurationError,
    Fetching,
    FetchFailed,
    ParseFailed,
    SyncFailed,
    IndexFailed,
    Synced,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Suspended => "Suspended",
            Reason::ConfigurationError => "ConfigurationError",
            Reason::Fetching => "Fetching",
            Reason::FetchFailed => "FetchFailed",
            Reason::ParseFailed => "ParseFailed",
            Reason::SyncFailed => "SyncFailed",
            Reason::IndexFailed => "IndexFailed",
            Reason::Synced => "Synced",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insert or update the condition of `condition_type`.
///
/// An existing entry is updated in place so its position is preserved;
/// `last_transition_time` only moves when the status flips. Otherwise the
/// condition is appended.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: ConditionStatus,
    reason: Reason,
    message: impl Into<String>,
    observed_generation: i64,
    now: DateTime<Utc>,
) {
    let message = message.into();
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status;
        existing.reason = reason.as_str().to_string();
        existing.message = message;
        existing.observed_generation = observed_generation;
        return;
    }

    conditions.push(Condition {
        condition_type: condition_type.to_string(),
        status,
        reason: reason.as_str().to_string(),
        message,
        observed_generation,
        last_transition_time: now,
    });
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// `true` when the condition exists with status `True`.
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn appends_new_condition_types_in_order() {
        let now = Utc::now();
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_READY, ConditionStatus::False, Reason::Fetching, "", 1, now);
        set_condition(
            &mut conditions,
            CONDITION_ARTIFACT_AVAILABLE,
            ConditionStatus::False,
            Reason::Fetching,
            "",
            1,
            now,
        );
        let types: Vec<_> = conditions.iter().map(|c| c.condition_type.as_str()).collect();
        assert_eq!(types, vec![CONDITION_READY, CONDITION_ARTIFACT_AVAILABLE]);
    }

    #[test]
    fn replaces_in_place_and_preserves_position() {
        let t0 = Utc::now();
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_READY, ConditionStatus::False, Reason::Fetching, "", 1, t0);
        set_condition(&mut conditions, "Other", ConditionStatus::True, Reason::Synced, "", 1, t0);

        let t1 = t0 + Duration::seconds(10);
        set_condition(&mut conditions, CONDITION_READY, ConditionStatus::True, Reason::Synced, "ok", 2, t1);

        assert_eq!(conditions.len(), 2);
        let ready = &conditions[0];
        assert_eq!(ready.condition_type, CONDITION_READY);
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, "Synced");
        assert_eq!(ready.message, "ok");
        assert_eq!(ready.observed_generation, 2);
        assert_eq!(ready.last_transition_time, t1);
    }

    #[test]
    fn transition_time_kept_when_status_unchanged() {
        let t0 = Utc::now();
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_READY, ConditionStatus::False, Reason::Fetching, "", 1, t0);
        let t1 = t0 + Duration::seconds(30);
        set_condition(&mut conditions, CONDITION_READY, ConditionStatus::False, Reason::FetchFailed, "boom", 1, t1);

        let ready = find_condition(&conditions, CONDITION_READY).expect("ready");
        assert_eq!(ready.last_transition_time, t0);
        assert_eq!(ready.reason, "FetchFailed");
        assert!(!is_condition_true(&conditions, CONDITION_READY));
    }
}
