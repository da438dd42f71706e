//! Well-known names shared across the operator.

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

pub const LABEL_MANAGED_BY: &str = "stoppable.dev/managed-by";
pub const LABEL_INSTANCE: &str = "stoppable.dev/instance";
pub const LABEL_ROLE: &str = "stoppable.dev/role";
pub const MANAGED_BY_VALUE: &str = "stoppable-operator";
pub const ROLE_PROVIDER: &str = "provider";
pub const ROLE_CONSUMER: &str = "consumer";

pub const WORKLOAD_FINALIZER: &str = "workload.stoppable.dev/finalizer";
pub const INSTANCE_FINALIZER: &str = "instance.stoppable.dev/finalizer";

pub const DEFAULT_HOST_PATH_PREFIX: &str = "/var/lib/stoppablecontainer";

/// Provider pod name for an instance.
pub fn provider_pod_name(instance: &str) -> String {
    format!("{}-provider", instance)
}

/// Consumer pod name for an instance. Deliberately the bare instance name so
/// `kubectl exec <name>` works the way users expect.
pub fn consumer_pod_name(instance: &str) -> String {
    instance.to_string()
}

/// Per-instance host directory: `<prefix>/<namespace>/<name>`.
pub fn host_path(prefix: Option<&str>, namespace: &str, name: &str) -> String {
    let prefix = match prefix {
        Some(p) if !p.is_empty() => p,
        _ => DEFAULT_HOST_PATH_PREFIX,
    };
    format!("{}/{}/{}", prefix.trim_end_matches('/'), namespace, name)
}

pub fn has_finalizer(meta: &metav1::ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == finalizer))
        .unwrap_or(false)
}

/// Adds the finalizer; returns true when it was not present yet.
pub fn add_finalizer(meta: &mut metav1::ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

pub fn remove_finalizer(meta: &mut metav1::ObjectMeta, finalizer: &str) {
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|x| x != finalizer);
    }
}
