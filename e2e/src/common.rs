#![allow(unused_imports)]
#![allow(unused_variables)]

use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, AttachedProcess, DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
    Client, ResourceExt,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get kube client: {0}")]
    ClientGetFailed(#[from] kube::Error),

    #[error("Failed to apply yaml file!")]
    ApplyFailed,

    #[error("Failed to parse the yaml file!")]
    ParseYamlFailed(#[from] serde_yaml::Error),

    #[error("Failed to parse the json format!")]
    ParseJsonFailed(#[from] serde_json::Error),

    #[error("Failed to get CRD: {0}")]
    CRDGetFailed(#[source] kube::Error),

    #[error("Timeout, e2e test failed!")]
    Timeout,

    #[error("Workload status is not consistent with the expected state!")]
    WorkloadStateFailed,

    #[error("Workload rootfs did not preserve written data!")]
    PreservationFailed,

    #[error("Consumer pod security posture check failed!")]
    SecurityPostureFailed,

    #[error("Cascading deletion did not complete!")]
    DeletionFailed,

    #[error("Mount agent protocol check failed!")]
    ProtocolFailed,
}

pub async fn apply(yaml: String, client: Client, discovery: &Discovery) -> Result<String, Error> {
    let ssapply = PatchParams::apply("stoppable-e2e").force();
    let doc = serde_yaml::from_str(&yaml)?;

    let obj: DynamicObject = serde_yaml::from_value(doc)?;
    let namespace = obj.metadata.namespace.as_deref();
    let gvk = if let Some(tm) = &obj.types {
        GroupVersionKind::try_from(tm).unwrap()
    } else {
        println!("cannot apply object without valid TypeMeta {:?}", obj);
        return Err(Error::ApplyFailed);
    };
    let name = obj.name_any();
    if let Some((ar, caps)) = discovery.resolve_gvk(&gvk) {
        let api = dynamic_api(ar, caps, client.clone(), namespace, false);
        let data: serde_json::Value = serde_json::to_value(&obj)?;
        let _r = api.patch(&name, &ssapply, &Patch::Apply(data)).await?;
        println!("applied {} {}", gvk.kind, name);
    } else {
        println!("Cannot apply document for unknown {:?}", gvk);
        return Err(Error::ApplyFailed);
    }

    Ok(name)
}

fn dynamic_api(
    ar: ApiResource,
    caps: ApiCapabilities,
    client: Client,
    ns: Option<&str>,
    all: bool,
) -> Api<DynamicObject> {
    if caps.scope == Scope::Cluster || all {
        Api::all_with(client, &ar)
    } else if let Some(namespace) = ns {
        Api::namespaced_with(client, namespace, &ar)
    } else {
        Api::default_namespaced_with(client, &ar)
    }
}

pub async fn get_output_and_err(mut attached: AttachedProcess) -> (String, String) {
    let stdout = tokio_util::io::ReaderStream::new(attached.stdout().unwrap());
    let out = stdout
        .filter_map(|r| async { r.ok().and_then(|v| String::from_utf8(v.to_vec()).ok()) })
        .collect::<Vec<_>>()
        .await
        .join("");
    let stderr = tokio_util::io::ReaderStream::new(attached.stderr().unwrap());
    let err = stderr
        .filter_map(|r| async { r.ok().and_then(|v| String::from_utf8(v.to_vec()).ok()) })
        .collect::<Vec<_>>()
        .await
        .join("");
    attached.join().await.unwrap();
    (out, err)
}
