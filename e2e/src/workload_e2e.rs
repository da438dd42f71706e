#![allow(unused_imports)]
#![allow(unused_variables)]

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams},
    discovery::Discovery,
    Client,
};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use stoppable_controller::workload_types::{Workload, WorkloadPhase};

use crate::common::*;

pub fn demo_workload(name: &str) -> String {
    format!(
        "
    apiVersion: stoppable.dev/v1alpha1
    kind: Workload
    metadata:
      name: {}
      namespace: default
    spec:
      running: true
      template:
        spec:
          containers:
          - name: app
            image: busybox:stable
            command: [\"/bin/sh\", \"-c\", \"echo hi; sleep 3600\"]
    ",
        name
    )
}

async fn wait_for_phase(
    client: Client,
    name: &str,
    phase: WorkloadPhase,
    timeout: Duration,
) -> Result<(), Error> {
    let api: Api<Workload> = Api::default_namespaced(client);
    let start = Instant::now();
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > timeout {
            return Err(Error::Timeout);
        }
        match api.get(name).await {
            Err(e) => {
                println!("Get workload failed with error {}.", e);
                continue;
            }
            Ok(workload) => {
                let current = workload.status.as_ref().and_then(|s| s.phase);
                println!("Workload {} phase: {:?}", name, current);
                if current == Some(phase) {
                    return Ok(());
                }
            }
        }
    }
}

async fn exec_in_pod(
    client: Client,
    pod: &str,
    container: Option<&str>,
    command: Vec<&str>,
) -> Result<(String, String), Error> {
    let pod_api: Api<Pod> = Api::default_namespaced(client);
    let mut params = AttachParams::default().stderr(true);
    if let Some(container) = container {
        params = params.container(container);
    }
    let attached = pod_api.exec(pod, command, &params).await?;
    Ok(get_output_and_err(attached).await)
}

/// S1: create-and-run. The workload reaches Running, both pods exist, and
/// the user command's output shows up in the consumer logs.
pub async fn create_and_run_test(client: Client, name: &str) -> Result<(), Error> {
    wait_for_phase(client.clone(), name, WorkloadPhase::Running, Duration::from_secs(180)).await?;

    let pod_api: Api<Pod> = Api::default_namespaced(client.clone());
    pod_api
        .get(&format!("{}-provider", name))
        .await
        .map_err(|_| Error::WorkloadStateFailed)?;
    pod_api.get(name).await.map_err(|_| Error::WorkloadStateFailed)?;

    let logs = pod_api
        .logs(name, &LogParams::default())
        .await
        .map_err(|_| Error::WorkloadStateFailed)?;
    if !logs.contains("hi") {
        println!("Consumer logs missing expected output: {}", logs);
        return Err(Error::WorkloadStateFailed);
    }

    println!("Create-and-run test passed.");
    Ok(())
}

/// S2: stopping preserves the rootfs. Writes a marker, flips running=false,
/// and checks the consumer is gone while the provider stays ready.
pub async fn stop_preserves_test(client: Client, name: &str) -> Result<(), Error> {
    exec_in_pod(
        client.clone(),
        name,
        None,
        vec!["sh", "-c", "echo token-xyz > /tmp/marker"],
    )
    .await?;

    let api: Api<Workload> = Api::default_namespaced(client.clone());
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({"spec": {"running": false}})),
    )
    .await?;

    wait_for_phase(client.clone(), name, WorkloadPhase::Stopped, Duration::from_secs(60)).await?;

    let pod_api: Api<Pod> = Api::default_namespaced(client.clone());
    if pod_api.get_opt(name).await?.is_some() {
        println!("Consumer pod still exists after stop.");
        return Err(Error::WorkloadStateFailed);
    }
    if pod_api.get_opt(&format!("{}-provider", name)).await?.is_none() {
        println!("Provider pod disappeared on stop.");
        return Err(Error::WorkloadStateFailed);
    }

    println!("Stop-preserves test passed.");
    Ok(())
}

/// S3: restart observes preservation. The marker written before the stop is
/// still there after the consumer comes back.
pub async fn restart_preserves_test(client: Client, name: &str) -> Result<(), Error> {
    let api: Api<Workload> = Api::default_namespaced(client.clone());
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({"spec": {"running": true}})),
    )
    .await?;

    wait_for_phase(client.clone(), name, WorkloadPhase::Running, Duration::from_secs(180)).await?;

    let (out, err) = exec_in_pod(client.clone(), name, None, vec!["cat", "/tmp/marker"]).await?;
    if !out.contains("token-xyz") {
        println!("Marker not preserved; got: {} ({})", out, err);
        return Err(Error::PreservationFailed);
    }

    println!("Restart-preserves test passed.");
    Ok(())
}

/// S5: security posture. The consumer holds the chroot capability and
/// nothing resembling mount administration.
pub async fn security_posture_test(client: Client, name: &str) -> Result<(), Error> {
    let pod_api: Api<Pod> = Api::default_namespaced(client.clone());
    let consumer = pod_api.get(name).await?;
    let container = &consumer.spec.as_ref().unwrap().containers[0];
    let ctx = container
        .security_context
        .as_ref()
        .ok_or(Error::SecurityPostureFailed)?;

    if ctx.privileged == Some(true) {
        return Err(Error::SecurityPostureFailed);
    }
    let add = ctx
        .capabilities
        .as_ref()
        .and_then(|c| c.add.clone())
        .unwrap_or_default();
    if !add.iter().any(|c| c == "SYS_CHROOT") || add.iter().any(|c| c == "SYS_ADMIN") {
        println!("Unexpected capability list: {:?}", add);
        return Err(Error::SecurityPostureFailed);
    }

    println!("Security posture test passed.");
    Ok(())
}

/// S4: deletion cascades. The consumer, the provider, and the Instance are
/// all gone before long.
pub async fn delete_cascades_test(client: Client, name: &str) -> Result<(), Error> {
    let api: Api<Workload> = Api::default_namespaced(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;

    let pod_api: Api<Pod> = Api::default_namespaced(client.clone());
    let start = Instant::now();
    loop {
        sleep(Duration::from_secs(5)).await;
        if start.elapsed() > Duration::from_secs(120) {
            return Err(Error::DeletionFailed);
        }
        let consumer = pod_api.get_opt(name).await?;
        let provider = pod_api.get_opt(&format!("{}-provider", name)).await?;
        let workload = api.get_opt(name).await?;
        if consumer.is_none() && provider.is_none() && workload.is_none() {
            break;
        }
        println!("Waiting for cascading deletion to finish...");
    }

    println!("Delete-cascades test passed.");
    Ok(())
}

/// S6: protocol error path. A request naming a nonexistent pod UID gets an
/// error answer from the agent and no new mount.
pub async fn protocol_error_test(client: Client, name: &str) -> Result<(), Error> {
    // The rootfs sidecar sees the work directory at /hostmount and has a
    // shell (busybox), so drive the protocol from there.
    let provider = format!("{}-provider", name);
    exec_in_pod(
        client.clone(),
        &provider,
        Some("rootfs"),
        vec![
            "sh",
            "-c",
            "rm -f /hostmount/ready.json && \
             echo '{\"pod_uid\":\"00000000-dead-beef-0000-000000000000\"}' > /hostmount/request.json",
        ],
    )
    .await?;

    let start = Instant::now();
    loop {
        sleep(Duration::from_secs(2)).await;
        if start.elapsed() > Duration::from_secs(30) {
            return Err(Error::ProtocolFailed);
        }
        let (out, _) = exec_in_pod(
            client.clone(),
            &provider,
            Some("rootfs"),
            vec!["cat", "/hostmount/ready.json"],
        )
        .await?;
        if out.contains("\"status\":\"error\"") {
            println!("Agent answered with an error as expected: {}", out);
            break;
        }
    }

    println!("Protocol error test passed.");
    Ok(())
}

pub async fn workload_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    match crd_api.get("workloads.stoppable.dev").await {
        Err(e) => {
            println!("No CRD found, create one before running the e2e test.");
            return Err(Error::CRDGetFailed(e));
        }
        Ok(_) => println!("CRD found, continue to run the e2e test."),
    }

    let discovery = Discovery::new(client.clone()).run().await?;
    let name = apply(demo_workload("demo"), client.clone(), &discovery).await?;

    create_and_run_test(client.clone(), &name).await?;
    security_posture_test(client.clone(), &name).await?;
    stop_preserves_test(client.clone(), &name).await?;
    restart_preserves_test(client.clone(), &name).await?;
    delete_cascades_test(client.clone(), &name).await?;

    println!("E2e test passed.");
    Ok(())
}

pub async fn workload_protocol_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    let discovery = Discovery::new(client.clone()).run().await?;
    let name = apply(demo_workload("proto-demo"), client.clone(), &discovery).await?;

    create_and_run_test(client.clone(), &name).await?;
    protocol_error_test(client.clone(), &name).await?;
    delete_cascades_test(client.clone(), &name).await?;

    println!("Protocol e2e test passed.");
    Ok(())
}
