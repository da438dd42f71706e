//! Narrow persistence seam between the reconcilers and the API server.
//!
//! The reconcilers only ever need a handful of operations on three kinds;
//! hiding them behind a trait keeps the controllers free of client plumbing
//! and lets the property suites run against a deterministic in-memory store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ErrorResponse;
use kube::Client;
use serde_json::json;

use crate::instance_types::Instance;
use crate::workload_types::Workload;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    /// Terminal rejection (admission, validation). Not retried; surfaced in
    /// the object's status instead.
    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("api error: {0}")]
    Api(#[source] kube::Error),
}

impl StoreError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StoreError::Invalid(_))
    }
}

#[async_trait]
pub trait ResourceStore: Clone + Send + Sync + 'static {
    async fn get_workload(&self, namespace: &str, name: &str)
        -> Result<Option<Workload>, StoreError>;
    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError>;
    async fn update_workload_status(&self, workload: &Workload) -> Result<(), StoreError>;

    async fn get_instance(&self, namespace: &str, name: &str)
        -> Result<Option<Instance>, StoreError>;
    async fn create_instance(&self, instance: &Instance) -> Result<(), StoreError>;
    async fn update_instance(&self, instance: &Instance) -> Result<(), StoreError>;
    async fn update_instance_status(&self, instance: &Instance) -> Result<(), StoreError>;
    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_pod(&self, namespace: &str, name: &str)
        -> Result<Option<corev1::Pod>, StoreError>;
    async fn create_pod(&self, pod: &corev1::Pod) -> Result<(), StoreError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Production store over a kube client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }
}

fn classify(err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(ErrorResponse { reason, message, .. }) if reason == "AlreadyExists" => {
            StoreError::AlreadyExists(message.clone())
        }
        kube::Error::Api(ErrorResponse { code, message, .. }) if *code == 409 => {
            StoreError::Conflict(message.clone())
        }
        kube::Error::Api(ErrorResponse { code, reason, message, .. })
            if *code == 422 || reason == "Invalid" || reason == "BadRequest" =>
        {
            StoreError::Invalid(message.clone())
        }
        _ => StoreError::Api(err),
    }
}

fn object_keys(meta: &metav1::ObjectMeta) -> Result<(String, String), StoreError> {
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| StoreError::Invalid("object has no namespace".to_string()))?;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| StoreError::Invalid("object has no name".to_string()))?;
    Ok((namespace, name))
}

fn not_found_ok(err: kube::Error) -> Result<(), StoreError> {
    match &err {
        kube::Error::Api(ErrorResponse { reason, .. }) if reason == "NotFound" => Ok(()),
        _ => Err(classify(err)),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, StoreError> {
        Api::<Workload>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(classify)
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        let (namespace, name) = object_keys(&workload.metadata)?;
        Api::<Workload>::namespaced(self.client.clone(), &namespace)
            .replace(&name, &PostParams::default(), workload)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn update_workload_status(&self, workload: &Workload) -> Result<(), StoreError> {
        let (namespace, name) = object_keys(&workload.metadata)?;
        let status = json!({ "status": workload.status.clone().unwrap_or_default() });
        Api::<Workload>::namespaced(self.client.clone(), &namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn get_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Instance>, StoreError> {
        Api::<Instance>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(classify)
    }

    async fn create_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let (namespace, _) = object_keys(&instance.metadata)?;
        Api::<Instance>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), instance)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn update_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let (namespace, name) = object_keys(&instance.metadata)?;
        Api::<Instance>::namespaced(self.client.clone(), &namespace)
            .replace(&name, &PostParams::default(), instance)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn update_instance_status(&self, instance: &Instance) -> Result<(), StoreError> {
        let (namespace, name) = object_keys(&instance.metadata)?;
        let status = json!({ "status": instance.status.clone().unwrap_or_default() });
        Api::<Instance>::namespaced(self.client.clone(), &namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match Api::<Instance>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => not_found_ok(err),
        }
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Pod>, StoreError> {
        Api::<corev1::Pod>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(classify)
    }

    async fn create_pod(&self, pod: &corev1::Pod) -> Result<(), StoreError> {
        let (namespace, _) = object_keys(&pod.metadata)?;
        Api::<corev1::Pod>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), pod)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match Api::<corev1::Pod>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => not_found_ok(err),
        }
    }
}

/// Deterministic in-memory store backing the reconciler test suites.
///
/// Mimics the API server where it matters to the controllers: finalizers
/// defer deletion (`delete_*` sets the deletion timestamp, the object goes
/// away once an update leaves it finalizer-free), creations assign UIDs, and
/// double-creates fail with `AlreadyExists`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    workloads: BTreeMap<(String, String), Workload>,
    instances: BTreeMap<(String, String), Instance>,
    pods: BTreeMap<(String, String), corev1::Pod>,
    next_uid: u64,
    reject_pod_create: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a workload, assigning a UID the way the API server would.
    pub fn put_workload(&self, mut workload: Workload) {
        let mut inner = self.inner.lock().unwrap();
        if workload.metadata.uid.is_none() {
            inner.next_uid += 1;
            workload.metadata.uid = Some(format!("uid-{}", inner.next_uid));
        }
        let key = key_of(&workload.metadata);
        inner.workloads.insert(key, workload);
    }

    pub fn put_pod(&self, pod: corev1::Pod) {
        let key = key_of(&pod.metadata);
        self.inner.lock().unwrap().pods.insert(key, pod);
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.inner
            .lock()
            .unwrap()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn instance(&self, namespace: &str, name: &str) -> Option<Instance> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.inner.lock().unwrap().instances.values().cloned().collect()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<corev1::Pod> {
        self.inner
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pods(&self) -> Vec<corev1::Pod> {
        self.inner.lock().unwrap().pods.values().cloned().collect()
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// The next `create_pod` fails with a terminal admission error.
    pub fn reject_next_pod_create(&self, message: &str) {
        self.inner.lock().unwrap().reject_pod_create = Some(message.to_string());
    }
}

fn key_of(meta: &metav1::ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn finalizer_free(meta: &metav1::ObjectMeta) -> bool {
    meta.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true)
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, StoreError> {
        Ok(self.workload(namespace, name))
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        let key = key_of(&workload.metadata);
        let mut inner = self.inner.lock().unwrap();
        if workload.metadata.deletion_timestamp.is_some() && finalizer_free(&workload.metadata) {
            inner.workloads.remove(&key);
        } else {
            inner.workloads.insert(key, workload.clone());
        }
        Ok(())
    }

    async fn update_workload_status(&self, workload: &Workload) -> Result<(), StoreError> {
        let key = key_of(&workload.metadata);
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.workloads.get_mut(&key) {
            existing.status = workload.status.clone();
        }
        Ok(())
    }

    async fn get_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Instance>, StoreError> {
        Ok(self.instance(namespace, name))
    }

    async fn create_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let key = key_of(&instance.metadata);
        let mut inner = self.inner.lock().unwrap();
        if inner.instances.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!(
                "instance {}/{} already exists",
                key.0, key.1
            )));
        }
        let mut instance = instance.clone();
        if instance.metadata.uid.is_none() {
            inner.next_uid += 1;
            instance.metadata.uid = Some(format!("uid-{}", inner.next_uid));
        }
        inner.instances.insert(key, instance);
        Ok(())
    }

    async fn update_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let key = key_of(&instance.metadata);
        let mut inner = self.inner.lock().unwrap();
        if instance.metadata.deletion_timestamp.is_some() && finalizer_free(&instance.metadata) {
            inner.instances.remove(&key);
        } else {
            inner.instances.insert(key, instance.clone());
        }
        Ok(())
    }

    async fn update_instance_status(&self, instance: &Instance) -> Result<(), StoreError> {
        let key = key_of(&instance.metadata);
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.instances.get_mut(&key) {
            existing.status = instance.status.clone();
        }
        Ok(())
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.inner.lock().unwrap();
        if let Some(instance) = inner.instances.get_mut(&key) {
            if finalizer_free(&instance.metadata) {
                inner.instances.remove(&key);
            } else if instance.metadata.deletion_timestamp.is_none() {
                instance.metadata.deletion_timestamp = Some(metav1::Time(chrono::Utc::now()));
            }
        }
        Ok(())
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Pod>, StoreError> {
        Ok(self.pod(namespace, name))
    }

    async fn create_pod(&self, pod: &corev1::Pod) -> Result<(), StoreError> {
        let key = key_of(&pod.metadata);
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.reject_pod_create.take() {
            return Err(StoreError::Invalid(message));
        }
        if inner.pods.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!(
                "pod {}/{} already exists",
                key.0, key.1
            )));
        }
        let mut pod = pod.clone();
        if pod.metadata.uid.is_none() {
            inner.next_uid += 1;
            pod.metadata.uid = Some(format!("uid-{}", inner.next_uid));
        }
        inner.pods.insert(key, pod);
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}
