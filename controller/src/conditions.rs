use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

pub const CONDITION_READY: &str = "Ready";

pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> metav1::Condition {
    metav1::Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: metav1::Time(Utc::now()),
    }
}

/// Replaces the condition of the same type, keeping the previous transition
/// time when the status value did not change.
pub fn set_condition(conditions: &mut Vec<metav1::Condition>, mut new: metav1::Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) {
        if existing.status == new.status {
            new.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = new;
        return;
    }
    conditions.push(new);
}
