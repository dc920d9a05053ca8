//! Status types shared by the machine configuration CRDs

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., RenderDegraded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type is present with status True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Whether the condition of the given type is present with status False
pub fn is_condition_false(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Insert or replace a condition by type
///
/// If the existing condition already has the same status, reason and message
/// it is left untouched so `lastTransitionTime` keeps pointing at the real
/// transition. A status change keeps nothing from the old condition.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return;
            }
            let keep_time = existing.status == condition.status;
            let time = existing.last_transition_time;
            *existing = condition;
            if keep_time {
                existing.last_transition_time = time;
            }
        }
        None => conditions.push(condition),
    }
}

/// A rendered configuration reference plus the MachineConfigs it was built from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfiguration {
    /// Name of the rendered MachineConfig
    #[serde(default)]
    pub name: String,

    /// MachineConfigs that contributed to the rendered config, in merge order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source: Vec<ObjectReference>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn set_condition_inserts_new_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("RenderDegraded", ConditionStatus::False, "", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert!(is_condition_false(&conditions, "RenderDegraded"));
        assert!(!is_condition_true(&conditions, "RenderDegraded"));
    }

    #[test]
    fn set_condition_keeps_transition_time_when_identical() {
        let mut original = Condition::new("RenderDegraded", ConditionStatus::True, "", "broken");
        original.last_transition_time = Utc::now() - Duration::hours(1);
        let stamp = original.last_transition_time;
        let mut conditions = vec![original];

        set_condition(
            &mut conditions,
            Condition::new("RenderDegraded", ConditionStatus::True, "", "broken"),
        );
        assert_eq!(conditions[0].last_transition_time, stamp);

        // Same status, new message: message updates, transition time stays
        set_condition(
            &mut conditions,
            Condition::new("RenderDegraded", ConditionStatus::True, "", "still broken"),
        );
        assert_eq!(conditions[0].message, "still broken");
        assert_eq!(conditions[0].last_transition_time, stamp);
    }

    #[test]
    fn set_condition_status_change_moves_transition_time() {
        let mut original = Condition::new("RenderDegraded", ConditionStatus::True, "", "broken");
        original.last_transition_time = Utc::now() - Duration::hours(1);
        let stamp = original.last_transition_time;
        let mut conditions = vec![original];

        set_condition(
            &mut conditions,
            Condition::new("RenderDegraded", ConditionStatus::False, "", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].last_transition_time > stamp);
        assert!(is_condition_false(&conditions, "RenderDegraded"));
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let c = Condition::new("RenderDegraded", ConditionStatus::True, "Why", "What");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "RenderDegraded");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
