//! Reconciler for `Instance` objects.
//!
//! Drives one instance to its running or stopped state by creating,
//! observing, and deleting the provider and consumer pods, mirroring
//! observations into status, and releasing both pods through a finalizer on
//! deletion. Each reconcile is a pure pass: fetch, compute, mutate, requeue.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{info, warn};

use crate::common;
use crate::conditions::{self, CONDITION_READY};
use crate::context::{Data, Error};
use crate::instance_types::{Instance, InstancePhase};
use crate::pod_builder::PodBuilder;
use crate::pod_status::{self, PodState};
use crate::store::{ResourceStore, StoreError};

/// Intermediate phases requeue on this cadence to absorb pod-startup races.
const INTERMEDIATE_REQUEUE: Duration = Duration::from_secs(2);
const SHORT_REQUEUE: Duration = Duration::from_secs(1);

pub async fn reconcile<S: ResourceStore>(
    instance: Arc<Instance>,
    ctx: Arc<Data<S>>,
) -> Result<Action, Error> {
    let name = instance
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = instance
        .metadata
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    // Work on a fresh copy, not the (possibly stale) watch cache object.
    let mut instance = match ctx
        .store
        .get_instance(&namespace, &name)
        .await
        .map_err(Error::GetFailed)?
    {
        Some(instance) => instance,
        None => return Ok(Action::await_change()),
    };

    if instance.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&ctx, instance).await;
    }

    if common::add_finalizer(&mut instance.metadata, common::INSTANCE_FINALIZER) {
        ctx.store
            .update_instance(&instance)
            .await
            .map_err(Error::UpdateFailed)?;
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    let provider_name = common::provider_pod_name(&name);
    let consumer_name = common::consumer_pod_name(&name);
    let provider = ctx
        .store
        .get_pod(&namespace, &provider_name)
        .await
        .map_err(Error::GetFailed)?;
    let consumer = ctx
        .store
        .get_pod(&namespace, &consumer_name)
        .await
        .map_err(Error::GetFailed)?;

    let provider = match provider {
        Some(pod) => pod,
        None => {
            let pod = match PodBuilder::new(&instance, &ctx.config).provider_pod() {
                Ok(pod) => pod,
                Err(err) => {
                    return update_phase(&ctx, instance, InstancePhase::Failed, &err.to_string())
                        .await
                }
            };
            match ctx.store.create_pod(&pod).await {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(_)) => {
                    return Ok(Action::requeue(SHORT_REQUEUE))
                }
                Err(err) if err.is_terminal() => {
                    return update_phase(&ctx, instance, InstancePhase::Failed, &err.to_string())
                        .await
                }
                Err(err) => return Err(Error::PodCreateFailed(err)),
            }
            info!(pod = %provider_name, "created provider pod");
            return update_phase(
                &ctx,
                instance,
                InstancePhase::ProviderStarting,
                "Provider pod created",
            )
            .await;
        }
    };

    if !pod_status::is_pod_ready(&provider) {
        return update_phase(
            &ctx,
            instance,
            InstancePhase::ProviderStarting,
            "Waiting for provider pod to be ready",
        )
        .await;
    }

    // Provider is ready: mirror its placement into status.
    {
        let host_path = common::host_path(
            instance.spec.host_path_prefix.as_deref(),
            &namespace,
            &name,
        );
        let status = instance.status.get_or_insert_with(Default::default);
        status.node_name = provider.spec.as_ref().and_then(|s| s.node_name.clone());
        status.host_path = Some(format!("{}/rootfs", host_path));
        status.provider_pod_name = Some(provider_name.clone());
        status.provider_pod_uid = provider.metadata.uid.clone();
    }

    if !instance.spec.running {
        if consumer.is_some() {
            info!(pod = %consumer_name, "deleting consumer pod (stopping)");
            ctx.store
                .delete_pod(&namespace, &consumer_name)
                .await
                .map_err(Error::PodDeleteFailed)?;
            return update_phase(
                &ctx,
                instance,
                InstancePhase::Stopping,
                "Stopping consumer pod",
            )
            .await;
        }
        return update_phase(
            &ctx,
            instance,
            InstancePhase::Stopped,
            "Consumer stopped, provider maintaining filesystem",
        )
        .await;
    }

    let consumer = match consumer {
        Some(pod) => pod,
        None => {
            let node_name = instance
                .status
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default();
            if node_name.is_empty() {
                return update_phase(
                    &ctx,
                    instance,
                    InstancePhase::ProviderReady,
                    "Provider ready, waiting for node assignment",
                )
                .await;
            }
            let pod = match PodBuilder::new(&instance, &ctx.config).consumer_pod(&node_name) {
                Ok(pod) => pod,
                Err(err) => {
                    return update_phase(&ctx, instance, InstancePhase::Failed, &err.to_string())
                        .await
                }
            };
            match ctx.store.create_pod(&pod).await {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(_)) => {
                    return Ok(Action::requeue(SHORT_REQUEUE))
                }
                Err(err) if err.is_terminal() => {
                    return update_phase(&ctx, instance, InstancePhase::Failed, &err.to_string())
                        .await
                }
                Err(err) => return Err(Error::PodCreateFailed(err)),
            }
            info!(pod = %consumer_name, node = %node_name, "created consumer pod");
            return update_phase(
                &ctx,
                instance,
                InstancePhase::ConsumerStarting,
                "Consumer pod created",
            )
            .await;
        }
    };

    {
        let status = instance.status.get_or_insert_with(Default::default);
        status.consumer_pod_name = Some(consumer_name.clone());
        status.consumer_pod_uid = consumer.metadata.uid.clone();
    }

    match pod_status::pod_state(&consumer) {
        PodState::Failed { message } => {
            update_phase(
                &ctx,
                instance,
                InstancePhase::Failed,
                &format!("Consumer pod failed: {}", message),
            )
            .await
        }
        PodState::Running { ready: true } => {
            update_phase(&ctx, instance, InstancePhase::Running, "All pods running").await
        }
        _ => {
            update_phase(
                &ctx,
                instance,
                InstancePhase::ConsumerStarting,
                "Waiting for consumer pod to be ready",
            )
            .await
        }
    }
}

/// Deletion: consumer first, then provider, then drop the finalizer.
async fn handle_deletion<S: ResourceStore>(
    ctx: &Arc<Data<S>>,
    mut instance: Instance,
) -> Result<Action, Error> {
    if !common::has_finalizer(&instance.metadata, common::INSTANCE_FINALIZER) {
        return Ok(Action::await_change());
    }

    let name = instance.metadata.name.clone().unwrap_or_default();
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();

    let consumer_name = common::consumer_pod_name(&name);
    if ctx
        .store
        .get_pod(&namespace, &consumer_name)
        .await
        .map_err(Error::GetFailed)?
        .is_some()
    {
        ctx.store
            .delete_pod(&namespace, &consumer_name)
            .await
            .map_err(Error::PodDeleteFailed)?;
        info!(pod = %consumer_name, "deleted consumer pod");
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    let provider_name = common::provider_pod_name(&name);
    if ctx
        .store
        .get_pod(&namespace, &provider_name)
        .await
        .map_err(Error::GetFailed)?
        .is_some()
    {
        ctx.store
            .delete_pod(&namespace, &provider_name)
            .await
            .map_err(Error::PodDeleteFailed)?;
        info!(pod = %provider_name, "deleted provider pod");
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    common::remove_finalizer(&mut instance.metadata, common::INSTANCE_FINALIZER);
    ctx.store
        .update_instance(&instance)
        .await
        .map_err(Error::UpdateFailed)?;
    info!(instance = %name, "instance deleted");
    Ok(Action::await_change())
}

/// Persists the phase, message, observed generation, and Ready condition in
/// one status update, then requeues per the phase's discipline.
async fn update_phase<S: ResourceStore>(
    ctx: &Arc<Data<S>>,
    mut instance: Instance,
    phase: InstancePhase,
    message: &str,
) -> Result<Action, Error> {
    let generation = instance.metadata.generation;

    let (condition_status, reason) = match phase {
        InstancePhase::Running => ("True", "Running".to_string()),
        InstancePhase::Failed => ("False", "Failed".to_string()),
        other => ("False", other.to_string()),
    };

    let status = instance.status.get_or_insert_with(Default::default);
    status.phase = Some(phase);
    status.message = Some(message.to_string());
    status.observed_generation = generation;
    conditions::set_condition(
        &mut status.conditions,
        conditions::new_condition(CONDITION_READY, condition_status, &reason, message, generation),
    );

    ctx.store
        .update_instance_status(&instance)
        .await
        .map_err(Error::StatusUpdateFailed)?;

    if phase.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(INTERMEDIATE_REQUEUE))
    }
}

pub fn error_policy<S: ResourceStore>(
    _instance: Arc<Instance>,
    error: &Error,
    _ctx: Arc<Data<S>>,
) -> Action {
    warn!(error = %error, "instance reconcile failed");
    Action::requeue(Duration::from_secs(5))
}
