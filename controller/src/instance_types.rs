use std::fmt;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::workload_types::ProviderSpec;

/// A realized running context for one Workload. Created by the workload
/// controller with the same name as its parent; the pod template is frozen
/// at creation time.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "stoppable.dev", version = "v1alpha1", kind = "Instance")]
#[kube(namespaced, shortname = "inst", status = "InstanceStatus")]
#[kube(printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".spec.workloadName"}"#)]
#[kube(printcolumn = r#"{"name":"Running","type":"boolean","jsonPath":".spec.running"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Name of the parent Workload.
    pub workload_name: String,

    /// Whether the consumer pod should exist.
    #[serde(default = "default_running")]
    pub running: bool,

    /// Frozen copy of the parent's pod template.
    pub template: corev1::PodTemplateSpec,

    #[serde(default)]
    pub provider: ProviderSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path_prefix: Option<String>,
}

fn default_running() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum InstancePhase {
    Pending,
    ProviderStarting,
    ProviderReady,
    ConsumerStarting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl InstancePhase {
    /// Terminal phases do not self-requeue; reconciliation resumes on pod
    /// watch events. Failed stays recoverable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstancePhase::Running | InstancePhase::Stopped | InstancePhase::Failed
        )
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstancePhase::Pending => "Pending",
            InstancePhase::ProviderStarting => "ProviderStarting",
            InstancePhase::ProviderReady => "ProviderReady",
            InstancePhase::ConsumerStarting => "ConsumerStarting",
            InstancePhase::Running => "Running",
            InstancePhase::Stopping => "Stopping",
            InstancePhase::Stopped => "Stopped",
            InstancePhase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<InstancePhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_pod_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_pod_uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_pod_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_pod_uid: Option<String>,

    /// Full host path of the mounted rootfs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,

    /// Node where the provider landed; the consumer is pinned to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Pid of the rootfs container's pause process, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_pid: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
