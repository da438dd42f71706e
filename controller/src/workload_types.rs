use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A stoppable container as the user declares it: an image and command plus
/// a `running` flag. Flipping the flag stops and restarts the workload
/// process while its root filesystem stays mounted on the node.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "stoppable.dev", version = "v1alpha1", kind = "Workload")]
#[kube(namespaced, shortname = "wl", status = "WorkloadStatus")]
#[kube(printcolumn = r#"{"name":"Running","type":"boolean","jsonPath":".spec.running"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Whether the workload process should be running. The rootfs survives
    /// either way.
    #[serde(default)]
    pub running: bool,

    /// Pod template for the consumer pod; the first container is the
    /// workload container.
    pub template: corev1::PodTemplateSpec,

    /// Scheduling and sizing hints for the provider pod.
    #[serde(default)]
    pub provider: ProviderSpec,

    /// Prefix for the per-instance host directory shared between the
    /// provider, the node agent, and the consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path_prefix: Option<String>,
}

/// Provider pod knobs. The provider only holds the filesystem, so resources
/// should stay minimal.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<corev1::ResourceRequirements>,

    /// Node selector for the provider pod; the consumer follows its node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<corev1::Toleration>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum WorkloadPhase {
    Pending,
    ProviderReady,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkloadPhase::Pending => "Pending",
            WorkloadPhase::ProviderReady => "ProviderReady",
            WorkloadPhase::Running => "Running",
            WorkloadPhase::Stopped => "Stopped",
            WorkloadPhase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkloadPhase>,

    /// Name of the child Instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_pod_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_pod_name: Option<String>,

    /// Host path where the rootfs is exposed on the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
