//! End-to-end reconciler tests against the in-memory store: the full
//! bring-up, stop/start cycle, failure handling, and deletion cascade, plus
//! the ownership and pod-existence properties.

use std::sync::Arc;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

use stoppable_controller::common;
use stoppable_controller::config::Config;
use stoppable_controller::context::Data;
use stoppable_controller::instance_controller;
use stoppable_controller::instance_types::InstancePhase;
use stoppable_controller::store::{MemoryStore, ResourceStore};
use stoppable_controller::workload_controller;
use stoppable_controller::workload_types::{Workload, WorkloadPhase, WorkloadSpec};

const NS: &str = "default";
const NAME: &str = "demo";
const NODE: &str = "node-1";

fn template() -> corev1::PodTemplateSpec {
    corev1::PodTemplateSpec {
        metadata: None,
        spec: Some(corev1::PodSpec {
            containers: vec![corev1::Container {
                name: "app".to_string(),
                image: Some("busybox:stable".to_string()),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "echo hi; sleep 3600".to_string(),
                ]),
                ..corev1::Container::default()
            }],
            ..corev1::PodSpec::default()
        }),
    }
}

fn seed_workload(store: &MemoryStore, running: bool) {
    let mut workload = Workload::new(
        NAME,
        WorkloadSpec {
            running,
            template: template(),
            provider: Default::default(),
            host_path_prefix: None,
        },
    );
    workload.metadata.namespace = Some(NS.to_string());
    store.put_workload(workload);
}

fn data(store: &MemoryStore) -> Arc<Data<MemoryStore>> {
    Arc::new(Data {
        store: store.clone(),
        config: Config::default(),
    })
}

async fn reconcile_workload(store: &MemoryStore) {
    let workload = store.workload(NS, NAME).expect("workload exists");
    workload_controller::reconcile(Arc::new(workload), data(store))
        .await
        .expect("workload reconcile succeeds");
}

async fn reconcile_instance(store: &MemoryStore) {
    let instance = store.instance(NS, NAME).expect("instance exists");
    instance_controller::reconcile(Arc::new(instance), data(store))
        .await
        .expect("instance reconcile succeeds");
}

fn mark_pod_ready(store: &MemoryStore, name: &str) {
    let mut pod = store.pod(NS, name).expect("pod exists");
    if let Some(spec) = pod.spec.as_mut() {
        spec.node_name = Some(NODE.to_string());
    }
    pod.status = Some(corev1::PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![corev1::PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..corev1::PodCondition::default()
        }]),
        ..corev1::PodStatus::default()
    });
    store.put_pod(pod);
}

fn mark_pod_failed(store: &MemoryStore, name: &str, message: &str) {
    let mut pod = store.pod(NS, name).expect("pod exists");
    pod.status = Some(corev1::PodStatus {
        phase: Some("Failed".to_string()),
        message: Some(message.to_string()),
        ..corev1::PodStatus::default()
    });
    store.put_pod(pod);
}

fn instance_phase(store: &MemoryStore) -> Option<InstancePhase> {
    store.instance(NS, NAME)?.status?.phase
}

fn workload_phase(store: &MemoryStore) -> Option<WorkloadPhase> {
    store.workload(NS, NAME)?.status?.phase
}

/// Runs both reconcilers until the instance reports Running.
async fn bring_up(store: &MemoryStore) {
    seed_workload(store, true);
    reconcile_workload(store).await; // adds finalizer
    reconcile_workload(store).await; // creates the instance

    reconcile_instance(store).await; // adds finalizer
    reconcile_instance(store).await; // creates the provider pod
    assert_eq!(instance_phase(store), Some(InstancePhase::ProviderStarting));

    mark_pod_ready(store, &common::provider_pod_name(NAME));
    reconcile_instance(store).await; // creates the consumer pod
    assert_eq!(instance_phase(store), Some(InstancePhase::ConsumerStarting));

    mark_pod_ready(store, &common::consumer_pod_name(NAME));
    reconcile_instance(store).await;
    assert_eq!(instance_phase(store), Some(InstancePhase::Running));
}

#[tokio::test]
async fn workload_creates_exactly_one_owned_instance() {
    let store = MemoryStore::new();
    seed_workload(&store, true);

    reconcile_workload(&store).await;
    reconcile_workload(&store).await;
    reconcile_workload(&store).await;
    reconcile_workload(&store).await;

    let instances = store.instances();
    assert_eq!(instances.len(), 1);
    let instance = &instances[0];
    assert_eq!(instance.metadata.name.as_deref(), Some(NAME));
    assert_eq!(instance.spec.workload_name, NAME);
    assert!(instance.spec.running);

    let workload_uid = store.workload(NS, NAME).unwrap().metadata.uid.unwrap();
    let owner = &instance.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.kind, "Workload");
    assert_eq!(owner.uid, workload_uid);

    assert_eq!(workload_phase(&store), Some(WorkloadPhase::Pending));
}

#[tokio::test]
async fn full_bring_up_reaches_running_with_both_pods_ready() {
    let store = MemoryStore::new();
    bring_up(&store).await;

    // Both pods exist; the consumer is pinned to the provider's node.
    let provider = store.pod(NS, &common::provider_pod_name(NAME)).unwrap();
    let consumer = store.pod(NS, &common::consumer_pod_name(NAME)).unwrap();
    assert_eq!(
        consumer.spec.as_ref().unwrap().node_name.as_deref(),
        Some(NODE)
    );

    let status = store.instance(NS, NAME).unwrap().status.unwrap();
    assert_eq!(status.node_name.as_deref(), Some(NODE));
    assert_eq!(
        status.host_path.as_deref(),
        Some("/var/lib/stoppablecontainer/default/demo/rootfs")
    );
    assert_eq!(status.provider_pod_uid, provider.metadata.uid);
    assert_eq!(status.consumer_pod_uid, consumer.metadata.uid);

    // Ready condition mirrors the phase.
    let ready = status
        .conditions
        .iter()
        .find(|c| c.type_ == "Ready")
        .unwrap();
    assert_eq!(ready.status, "True");
    assert_eq!(ready.reason, "Running");

    reconcile_workload(&store).await;
    assert_eq!(workload_phase(&store), Some(WorkloadPhase::Running));
}

#[tokio::test]
async fn stopping_deletes_only_the_consumer() {
    let store = MemoryStore::new();
    bring_up(&store).await;

    // User stops the workload.
    let mut workload = store.workload(NS, NAME).unwrap();
    workload.spec.running = false;
    store.update_workload(&workload).await.unwrap();

    reconcile_workload(&store).await;
    assert!(!store.instance(NS, NAME).unwrap().spec.running);

    reconcile_instance(&store).await;
    assert_eq!(instance_phase(&store), Some(InstancePhase::Stopping));
    assert!(store.pod(NS, &common::consumer_pod_name(NAME)).is_none());

    reconcile_instance(&store).await;
    assert_eq!(instance_phase(&store), Some(InstancePhase::Stopped));
    // The provider stays, holding the rootfs.
    assert!(store.pod(NS, &common::provider_pod_name(NAME)).is_some());

    reconcile_workload(&store).await;
    assert_eq!(workload_phase(&store), Some(WorkloadPhase::Stopped));
}

#[tokio::test]
async fn restart_recreates_the_consumer_in_place() {
    let store = MemoryStore::new();
    bring_up(&store).await;

    let mut workload = store.workload(NS, NAME).unwrap();
    workload.spec.running = false;
    store.update_workload(&workload).await.unwrap();
    reconcile_workload(&store).await;
    reconcile_instance(&store).await;
    reconcile_instance(&store).await;
    assert_eq!(instance_phase(&store), Some(InstancePhase::Stopped));

    let mut workload = store.workload(NS, NAME).unwrap();
    workload.spec.running = true;
    store.update_workload(&workload).await.unwrap();
    reconcile_workload(&store).await;

    reconcile_instance(&store).await;
    assert_eq!(instance_phase(&store), Some(InstancePhase::ConsumerStarting));

    mark_pod_ready(&store, &common::consumer_pod_name(NAME));
    reconcile_instance(&store).await;
    assert_eq!(instance_phase(&store), Some(InstancePhase::Running));
}

#[tokio::test]
async fn failed_consumer_surfaces_and_recovers() {
    let store = MemoryStore::new();
    bring_up(&store).await;

    mark_pod_failed(&store, &common::consumer_pod_name(NAME), "node out of disk");
    reconcile_instance(&store).await;
    assert_eq!(instance_phase(&store), Some(InstancePhase::Failed));
    let message = store
        .instance(NS, NAME)
        .unwrap()
        .status
        .unwrap()
        .message
        .unwrap();
    assert!(message.contains("node out of disk"));

    reconcile_workload(&store).await;
    assert_eq!(workload_phase(&store), Some(WorkloadPhase::Failed));
    let workload = store.workload(NS, NAME).unwrap();
    let ready = workload
        .status
        .unwrap()
        .conditions
        .into_iter()
        .find(|c| c.type_ == "Ready")
        .unwrap();
    assert_eq!(ready.reason, "Failed");
    assert!(ready.message.contains("node out of disk"));

    // Failed is not terminal: once the broken pod is gone the consumer is
    // recreated against the still-ready provider.
    store.remove_pod(NS, &common::consumer_pod_name(NAME));
    reconcile_instance(&store).await;
    assert_eq!(instance_phase(&store), Some(InstancePhase::ConsumerStarting));

    mark_pod_ready(&store, &common::consumer_pod_name(NAME));
    reconcile_instance(&store).await;
    assert_eq!(instance_phase(&store), Some(InstancePhase::Running));
}

#[tokio::test]
async fn deletion_cascades_through_pods_before_metadata_is_released() {
    let store = MemoryStore::new();
    bring_up(&store).await;

    // User deletes the workload; the finalizer defers removal.
    let mut workload = store.workload(NS, NAME).unwrap();
    workload.metadata.deletion_timestamp = Some(metav1::Time(chrono::Utc::now()));
    store.update_workload(&workload).await.unwrap();

    reconcile_workload(&store).await;
    let instance = store.instance(NS, NAME).unwrap();
    assert!(instance.metadata.deletion_timestamp.is_some());

    reconcile_instance(&store).await;
    assert!(store.pod(NS, &common::consumer_pod_name(NAME)).is_none());
    assert!(store.pod(NS, &common::provider_pod_name(NAME)).is_some());

    reconcile_instance(&store).await;
    assert!(store.pod(NS, &common::provider_pod_name(NAME)).is_none());

    reconcile_instance(&store).await;
    assert!(store.instance(NS, NAME).is_none());

    reconcile_workload(&store).await;
    assert!(store.workload(NS, NAME).is_none());
}

#[tokio::test]
async fn stopped_workload_without_instance_reports_stopped() {
    let store = MemoryStore::new();
    seed_workload(&store, false);

    reconcile_workload(&store).await; // finalizer
    reconcile_workload(&store).await;

    assert!(store.instances().is_empty());
    assert_eq!(workload_phase(&store), Some(WorkloadPhase::Stopped));
}

#[tokio::test]
async fn empty_template_fails_the_instance_without_pods() {
    let store = MemoryStore::new();
    let mut workload = Workload::new(
        NAME,
        WorkloadSpec {
            running: true,
            template: corev1::PodTemplateSpec {
                metadata: None,
                spec: Some(corev1::PodSpec::default()),
            },
            provider: Default::default(),
            host_path_prefix: None,
        },
    );
    workload.metadata.namespace = Some(NS.to_string());
    store.put_workload(workload);

    reconcile_workload(&store).await;
    reconcile_workload(&store).await;
    reconcile_instance(&store).await; // finalizer
    reconcile_instance(&store).await;

    assert_eq!(instance_phase(&store), Some(InstancePhase::Failed));
    assert!(store.pods().is_empty());
    let message = store
        .instance(NS, NAME)
        .unwrap()
        .status
        .unwrap()
        .message
        .unwrap();
    assert!(message.contains("no containers"));
}

#[tokio::test]
async fn admission_rejection_is_terminal_with_message() {
    let store = MemoryStore::new();
    seed_workload(&store, true);
    reconcile_workload(&store).await;
    reconcile_workload(&store).await;
    reconcile_instance(&store).await; // finalizer

    store.reject_next_pod_create("denied by policy: hostPath not allowed");
    reconcile_instance(&store).await;

    assert_eq!(instance_phase(&store), Some(InstancePhase::Failed));
    let message = store
        .instance(NS, NAME)
        .unwrap()
        .status
        .unwrap()
        .message
        .unwrap();
    assert!(message.contains("denied by policy"));
}

#[tokio::test]
async fn finalizers_are_added_once() {
    let store = MemoryStore::new();
    seed_workload(&store, true);

    reconcile_workload(&store).await;
    reconcile_workload(&store).await;
    reconcile_workload(&store).await;
    let workload = store.workload(NS, NAME).unwrap();
    let finalizers = workload.metadata.finalizers.unwrap();
    assert_eq!(finalizers, vec![common::WORKLOAD_FINALIZER.to_string()]);

    reconcile_instance(&store).await;
    reconcile_instance(&store).await;
    let instance = store.instance(NS, NAME).unwrap();
    let finalizers = instance.metadata.finalizers.unwrap();
    assert_eq!(finalizers, vec![common::INSTANCE_FINALIZER.to_string()]);
}
