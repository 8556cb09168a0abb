//! Status conditions reported on managed resources.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionType {
    Ready,
    Synced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionReason {
    Available,
    Unavailable,
    Creating,
    Deleting,
    ReconcileSuccess,
    ReconcileError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: String,
}

impl Condition {
    fn new(kind: ConditionType, status: ConditionStatus, reason: ConditionReason) -> Self {
        Self { kind, status, reason, message: None, last_transition_time: now_rfc3339() }
    }

    /// The external resource exists and is usable.
    pub fn available() -> Self { Self::new(ConditionType::Ready, ConditionStatus::True, ConditionReason::Available) }
    pub fn unavailable() -> Self { Self::new(ConditionType::Ready, ConditionStatus::False, ConditionReason::Unavailable) }
    pub fn creating() -> Self { Self::new(ConditionType::Ready, ConditionStatus::False, ConditionReason::Creating) }
    pub fn deleting() -> Self { Self::new(ConditionType::Ready, ConditionStatus::False, ConditionReason::Deleting) }
    pub fn reconcile_success() -> Self {
        Self::new(ConditionType::Synced, ConditionStatus::True, ConditionReason::ReconcileSuccess)
    }

    pub fn reconcile_error(message: impl Into<String>) -> Self {
        let mut c = Self::new(ConditionType::Synced, ConditionStatus::False, ConditionReason::ReconcileError);
        c.message = Some(message.into());
        c
    }

    /// Equal ignoring the transition time.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.kind == other.kind && self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ResourceStatus {
    /// Set a condition, replacing any of the same type. The transition time of
    /// an unchanged condition is kept.
    pub fn set_condition(&mut self, c: Condition) {
        match self.conditions.iter_mut().find(|x| x.kind == c.kind) {
            Some(existing) if existing.same_state(&c) => {}
            Some(existing) => *existing = c,
            None => self.conditions.push(c),
        }
    }

    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn is_ready(&self) -> bool {
        self.condition(ConditionType::Ready).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_replaces_by_type() {
        let mut st = ResourceStatus::default();
        st.set_condition(Condition::creating());
        st.set_condition(Condition::reconcile_success());
        st.set_condition(Condition::available());
        assert_eq!(st.conditions.len(), 2);
        assert!(st.is_ready());
        assert_eq!(st.condition(ConditionType::Synced).unwrap().reason, ConditionReason::ReconcileSuccess);
    }

    #[test]
    fn unchanged_condition_keeps_transition_time() {
        let mut st = ResourceStatus::default();
        let mut first = Condition::available();
        first.last_transition_time = "2020-01-01T00:00:00Z".into();
        st.set_condition(first);
        st.set_condition(Condition::available());
        assert_eq!(st.conditions[0].last_transition_time, "2020-01-01T00:00:00Z");
    }

    #[test]
    fn reconcile_error_carries_message() {
        let c = Condition::reconcile_error("cannot create role: boom");
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.message.as_deref(), Some("cannot create role: boom"));
    }
}
