use k8s_openapi::api::core::v1 as corev1;

/// Typed view of a pod's lifecycle state, extracted once instead of spread
/// across string comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodState {
    Pending,
    Running { ready: bool },
    Succeeded,
    Failed { message: String },
    Unknown,
}

pub fn pod_state(pod: &corev1::Pod) -> PodState {
    let status = match &pod.status {
        Some(status) => status,
        None => return PodState::Unknown,
    };
    match status.phase.as_deref() {
        Some("Pending") => PodState::Pending,
        Some("Running") => PodState::Running {
            ready: has_ready_condition(status),
        },
        Some("Succeeded") => PodState::Succeeded,
        Some("Failed") => PodState::Failed {
            message: failure_message(status),
        },
        _ => PodState::Unknown,
    }
}

pub fn is_pod_ready(pod: &corev1::Pod) -> bool {
    matches!(pod_state(pod), PodState::Running { ready: true })
}

fn has_ready_condition(status: &corev1::PodStatus) -> bool {
    status
        .conditions
        .as_ref()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Best human-readable reason for a failed pod: status message, then status
/// reason, then the first waiting/terminated container reason.
fn failure_message(status: &corev1::PodStatus) -> String {
    if let Some(message) = status.message.as_ref().filter(|m| !m.is_empty()) {
        return message.clone();
    }
    if let Some(reason) = status.reason.as_ref().filter(|r| !r.is_empty()) {
        return reason.clone();
    }
    if let Some(containers) = &status.container_statuses {
        for cs in containers {
            if let Some(state) = &cs.state {
                if let Some(waiting) = &state.waiting {
                    if let Some(reason) = waiting.reason.as_ref().filter(|r| !r.is_empty()) {
                        return reason.clone();
                    }
                }
                if let Some(terminated) = &state.terminated {
                    if let Some(reason) = terminated.reason.as_ref().filter(|r| !r.is_empty()) {
                        return reason.clone();
                    }
                }
            }
        }
    }
    "Unknown".to_string()
}
