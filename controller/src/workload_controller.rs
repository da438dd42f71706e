//! Reconciler for `Workload` objects.
//!
//! Projects the user-facing object onto exactly one child `Instance` of the
//! same name: desired state flows down (the `running` flag), observed state
//! flows up (the status projection table), and deletion cascades through the
//! finalizer until the child is gone.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::Resource;
use tracing::{info, warn};

use crate::common;
use crate::conditions::{self, CONDITION_READY};
use crate::context::{Data, Error};
use crate::instance_types::{Instance, InstancePhase, InstanceSpec};
use crate::store::{ResourceStore, StoreError};
use crate::workload_types::{Workload, WorkloadPhase};

const INTERMEDIATE_REQUEUE: Duration = Duration::from_secs(2);
const CREATION_REQUEUE: Duration = Duration::from_secs(1);

pub async fn reconcile<S: ResourceStore>(
    workload: Arc<Workload>,
    ctx: Arc<Data<S>>,
) -> Result<Action, Error> {
    let name = workload
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = workload
        .metadata
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let mut workload = match ctx
        .store
        .get_workload(&namespace, &name)
        .await
        .map_err(Error::GetFailed)?
    {
        Some(workload) => workload,
        None => return Ok(Action::await_change()),
    };

    if workload.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&ctx, workload).await;
    }

    if common::add_finalizer(&mut workload.metadata, common::WORKLOAD_FINALIZER) {
        ctx.store
            .update_workload(&workload)
            .await
            .map_err(Error::UpdateFailed)?;
        return Ok(Action::requeue(CREATION_REQUEUE));
    }

    let instance = ctx
        .store
        .get_instance(&namespace, &name)
        .await
        .map_err(Error::GetFailed)?;

    if workload.spec.running {
        match instance {
            None => create_instance(&ctx, workload).await,
            Some(mut instance) => {
                if !instance.spec.running {
                    instance.spec.running = true;
                    ctx.store
                        .update_instance(&instance)
                        .await
                        .map_err(Error::UpdateFailed)?;
                    info!(workload = %name, "started container instance");
                }
                project_status(&ctx, workload, &instance).await
            }
        }
    } else {
        match instance {
            Some(mut instance) => {
                if instance.spec.running {
                    instance.spec.running = false;
                    ctx.store
                        .update_instance(&instance)
                        .await
                        .map_err(Error::UpdateFailed)?;
                    info!(workload = %name, "stopping container instance");
                }
                project_status(&ctx, workload, &instance).await
            }
            None => set_stopped_without_instance(&ctx, workload).await,
        }
    }
}

async fn handle_deletion<S: ResourceStore>(
    ctx: &Arc<Data<S>>,
    mut workload: Workload,
) -> Result<Action, Error> {
    if !common::has_finalizer(&workload.metadata, common::WORKLOAD_FINALIZER) {
        return Ok(Action::await_change());
    }

    let name = workload.metadata.name.clone().unwrap_or_default();
    let namespace = workload.metadata.namespace.clone().unwrap_or_default();

    if ctx
        .store
        .get_instance(&namespace, &name)
        .await
        .map_err(Error::GetFailed)?
        .is_some()
    {
        ctx.store
            .delete_instance(&namespace, &name)
            .await
            .map_err(Error::InstanceDeleteFailed)?;
        info!(workload = %name, "deleted child instance");
        // Requeue until the instance controller has released its pods and
        // the instance is actually gone.
        return Ok(Action::requeue(CREATION_REQUEUE));
    }

    common::remove_finalizer(&mut workload.metadata, common::WORKLOAD_FINALIZER);
    ctx.store
        .update_workload(&workload)
        .await
        .map_err(Error::UpdateFailed)?;
    info!(workload = %name, "workload deleted");
    Ok(Action::await_change())
}

/// Creates the child instance with a frozen copy of the template.
async fn create_instance<S: ResourceStore>(
    ctx: &Arc<Data<S>>,
    mut workload: Workload,
) -> Result<Action, Error> {
    let name = workload.metadata.name.clone().unwrap_or_default();
    let namespace = workload.metadata.namespace.clone().unwrap_or_default();

    let owner_ref = workload
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    let mut instance = Instance::new(
        &name,
        InstanceSpec {
            workload_name: name.clone(),
            running: true,
            template: workload.spec.template.clone(),
            provider: workload.spec.provider.clone(),
            host_path_prefix: workload.spec.host_path_prefix.clone(),
        },
    );
    instance.metadata.namespace = Some(namespace.clone());
    instance.metadata.owner_references = Some(vec![owner_ref]);

    match ctx.store.create_instance(&instance).await {
        Ok(()) => {}
        Err(StoreError::AlreadyExists(_)) => return Ok(Action::requeue(CREATION_REQUEUE)),
        Err(err) => return Err(Error::InstanceCreateFailed(err)),
    }
    info!(workload = %name, "created instance");

    let generation = workload.metadata.generation;
    let status = workload.status.get_or_insert_with(Default::default);
    status.phase = Some(WorkloadPhase::Pending);
    status.instance_name = Some(name.clone());
    status.observed_generation = generation;
    conditions::set_condition(
        &mut status.conditions,
        conditions::new_condition(
            CONDITION_READY,
            "False",
            "InstanceCreated",
            "Instance has been created",
            generation,
        ),
    );
    ctx.store
        .update_workload_status(&workload)
        .await
        .map_err(Error::StatusUpdateFailed)?;

    Ok(Action::requeue(CREATION_REQUEUE))
}

/// The phase projection table: instance phase to workload phase plus Ready
/// condition.
fn project_phase(
    instance: &Instance,
) -> (WorkloadPhase, &'static str, &'static str, String) {
    let instance_phase = instance.status.as_ref().and_then(|s| s.phase);
    match instance_phase {
        Some(InstancePhase::Pending) | Some(InstancePhase::ProviderStarting) => (
            WorkloadPhase::Pending,
            "False",
            "Pending",
            "Instance is starting up".to_string(),
        ),
        Some(InstancePhase::ProviderReady) | Some(InstancePhase::ConsumerStarting) => (
            WorkloadPhase::ProviderReady,
            "False",
            "ProviderReady",
            "Provider is ready, consumer is starting".to_string(),
        ),
        Some(InstancePhase::Running) => (
            WorkloadPhase::Running,
            "True",
            "Running",
            "Container is running".to_string(),
        ),
        Some(InstancePhase::Stopping) | Some(InstancePhase::Stopped) => (
            WorkloadPhase::Stopped,
            "False",
            "Stopped",
            "Container is stopped, filesystem preserved".to_string(),
        ),
        Some(InstancePhase::Failed) => (
            WorkloadPhase::Failed,
            "False",
            "Failed",
            instance
                .status
                .as_ref()
                .and_then(|s| s.message.clone())
                .unwrap_or_default(),
        ),
        None => (
            WorkloadPhase::Pending,
            "Unknown",
            "Unknown",
            "Unknown state".to_string(),
        ),
    }
}

async fn project_status<S: ResourceStore>(
    ctx: &Arc<Data<S>>,
    mut workload: Workload,
    instance: &Instance,
) -> Result<Action, Error> {
    let (phase, condition_status, reason, message) = project_phase(instance);

    let generation = workload.metadata.generation;
    let instance_status = instance.status.clone().unwrap_or_default();
    let status = workload.status.get_or_insert_with(Default::default);
    status.phase = Some(phase);
    status.instance_name = instance.metadata.name.clone();
    status.provider_pod_name = instance_status.provider_pod_name;
    status.consumer_pod_name = instance_status.consumer_pod_name;
    status.host_path = instance_status.host_path;
    status.node_name = instance_status.node_name;
    status.observed_generation = generation;
    conditions::set_condition(
        &mut status.conditions,
        conditions::new_condition(CONDITION_READY, condition_status, reason, &message, generation),
    );

    ctx.store
        .update_workload_status(&workload)
        .await
        .map_err(Error::StatusUpdateFailed)?;

    match phase {
        WorkloadPhase::Running | WorkloadPhase::Stopped | WorkloadPhase::Failed => {
            Ok(Action::await_change())
        }
        _ => Ok(Action::requeue(INTERMEDIATE_REQUEUE)),
    }
}

/// Stopped with no child instance: nothing to observe, nothing to run.
async fn set_stopped_without_instance<S: ResourceStore>(
    ctx: &Arc<Data<S>>,
    mut workload: Workload,
) -> Result<Action, Error> {
    let generation = workload.metadata.generation;
    let status = workload.status.get_or_insert_with(Default::default);
    status.phase = Some(WorkloadPhase::Stopped);
    status.observed_generation = generation;
    conditions::set_condition(
        &mut status.conditions,
        conditions::new_condition(
            CONDITION_READY,
            "False",
            "Stopped",
            "Container is stopped, no instance exists",
            generation,
        ),
    );
    ctx.store
        .update_workload_status(&workload)
        .await
        .map_err(Error::StatusUpdateFailed)?;
    Ok(Action::await_change())
}

pub fn error_policy<S: ResourceStore>(
    _workload: Arc<Workload>,
    error: &Error,
    _ctx: Arc<Data<S>>,
) -> Action {
    warn!(error = %error, "workload reconcile failed");
    Action::requeue(Duration::from_secs(5))
}
