use std::env;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::controller::Controller,
    runtime::reflector::ObjectRef,
    Client, CustomResourceExt,
};
use tracing::{info, warn};

use stoppable_controller::common::{LABEL_INSTANCE, LABEL_MANAGED_BY, MANAGED_BY_VALUE};
use stoppable_controller::config::Config;
use stoppable_controller::context::Data;
use stoppable_controller::instance_controller;
use stoppable_controller::instance_types::Instance;
use stoppable_controller::store::KubeStore;
use stoppable_controller::workload_controller;
use stoppable_controller::workload_types::Workload;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).cloned().unwrap_or_default();
    if cmd == "export" {
        info!("exporting custom resource definitions");
        println!("{}", serde_yaml::to_string(&Workload::crd())?);
        println!("---");
        println!("{}", serde_yaml::to_string(&Instance::crd())?);
    } else if cmd == "run" {
        info!("running stoppable-controller");
        let client = Client::try_default().await?;
        let config = Config::from_env();
        run_controllers(client, config).await;
        info!("controllers terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}

async fn run_controllers(client: Client, config: Config) {
    let data = Arc::new(Data {
        store: KubeStore::new(client.clone()),
        config,
    });

    let managed_pods =
        ListParams::default().labels(&format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY_VALUE));

    // Pod events enqueue the owning instance through the instance label.
    let instance_ctrl = Controller::new(
        Api::<Instance>::all(client.clone()),
        ListParams::default(),
    )
    .watches(
        Api::<Pod>::all(client.clone()),
        managed_pods,
        |pod: Pod| -> Option<ObjectRef<Instance>> {
            let namespace = pod.metadata.namespace?;
            let instance = pod.metadata.labels?.get(LABEL_INSTANCE)?.clone();
            Some(ObjectRef::new(&instance).within(&namespace))
        },
    )
    .shutdown_on_signal()
    .run(
        instance_controller::reconcile,
        instance_controller::error_policy,
        data.clone(),
    )
    .for_each(|result| async move {
        match result {
            Ok(obj) => info!(object = ?obj, "reconciled instance"),
            Err(err) => warn!(error = %err, "instance reconcile failed"),
        }
    });

    // Instance events enqueue the parent workload by name.
    let workload_ctrl = Controller::new(
        Api::<Workload>::all(client.clone()),
        ListParams::default(),
    )
    .watches(
        Api::<Instance>::all(client.clone()),
        ListParams::default(),
        |instance: Instance| -> Option<ObjectRef<Workload>> {
            let namespace = instance.metadata.namespace?;
            Some(ObjectRef::new(&instance.spec.workload_name).within(&namespace))
        },
    )
    .shutdown_on_signal()
    .run(
        workload_controller::reconcile,
        workload_controller::error_policy,
        data.clone(),
    )
    .for_each(|result| async move {
        match result {
            Ok(obj) => info!(object = ?obj, "reconciled workload"),
            Err(err) => warn!(error = %err, "workload reconcile failed"),
        }
    });

    tokio::join!(instance_ctrl, workload_ctrl);
}
