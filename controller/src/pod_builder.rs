//! Deterministic rendering of the two pods realizing one Instance.
//!
//! The provider pod holds the user's rootfs alive (a pause process inside
//! the user image) and runs the driver that performs the mount rendezvous.
//! The consumer pod chroots into the mounted rootfs and runs the user's
//! command. Both renders are pure functions of (Instance, Config): same
//! input, byte-identical output.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;

use stoppable_rendezvous::{
    POD_NAMESPACE_ENV, POD_NAME_ENV, POD_UID_ENV, ROOTFS_MARKER_ENV, ROOTFS_MARKER_VALUE,
};

use crate::capabilities::CapabilitySet;
use crate::common;
use crate::config::Config;
use crate::instance_types::Instance;

pub const DRIVER_CONTAINER: &str = "driver";
pub const ROOTFS_CONTAINER: &str = "rootfs";
pub const WORKLOAD_CONTAINER: &str = "workload";
pub const PAUSE_INIT_CONTAINER: &str = "pause-init";
pub const EXEC_WRAPPER_INIT_CONTAINER: &str = "exec-wrapper-init";

pub const PROPAGATED_VOLUME: &str = "rootfs-propagated";
pub const PAUSE_VOLUME: &str = "pause-bin";
pub const HELPER_VOLUME: &str = "helper-bin";
pub const BIN_OVERLAY_VOLUME: &str = "bin-overlay";

pub const PROPAGATED_MOUNT_PATH: &str = "/propagated";
pub const HOST_MOUNT_PATH: &str = "/hostmount";
pub const ROOTFS_MOUNT_PATH: &str = "/rootfs";
pub const PAUSE_MOUNT_PATH: &str = "/.stoppable-pause";
pub const HELPER_MOUNT_PATH: &str = "/.stoppable-bin";
pub const BIN_OVERLAY_SEED_PATH: &str = "/.stoppable-bin-overlay";

/// Binary locations inside the trusted wrapper image.
const WRAPPER_EXEC_BIN: &str = "/stoppable-exec";
const WRAPPER_DRIVER_BIN: &str = "/stoppable-driver";
const WRAPPER_PAUSE_BIN: &str = "/stoppable-pause";
/// The helper as the consumer sees it after the init container installed it.
const HELPER_BIN: &str = "/.stoppable-bin/stoppable-exec";
const PAUSE_BIN: &str = "/.stoppable-pause/stoppable-pause";

const CHROOT_CAPABILITY: &str = "SYS_CHROOT";
const CONSUMER_ROOTFS_ENV: &str = "STOPPABLE_ROOTFS";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("template has no containers")]
    NoWorkloadContainer,

    #[error("workload container has no image")]
    MissingImage,

    #[error("instance has no name, namespace, or uid yet")]
    MissingInstanceMetadata,
}

pub struct PodBuilder<'a> {
    instance: &'a Instance,
    config: &'a Config,
}

impl<'a> PodBuilder<'a> {
    pub fn new(instance: &'a Instance, config: &'a Config) -> Self {
        PodBuilder { instance, config }
    }

    fn instance_name(&self) -> Result<&str, BuildError> {
        self.instance
            .metadata
            .name
            .as_deref()
            .ok_or(BuildError::MissingInstanceMetadata)
    }

    fn instance_namespace(&self) -> Result<&str, BuildError> {
        self.instance
            .metadata
            .namespace
            .as_deref()
            .ok_or(BuildError::MissingInstanceMetadata)
    }

    fn owner_reference(&self) -> Result<metav1::OwnerReference, BuildError> {
        self.instance
            .controller_owner_ref(&())
            .ok_or(BuildError::MissingInstanceMetadata)
    }

    fn workload_container(&self) -> Result<&corev1::Container, BuildError> {
        self.instance
            .spec
            .template
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .ok_or(BuildError::NoWorkloadContainer)
    }

    fn template_spec(&self) -> Option<&corev1::PodSpec> {
        self.instance.spec.template.spec.as_ref()
    }

    fn template_metadata(&self) -> Option<&metav1::ObjectMeta> {
        self.instance.spec.template.metadata.as_ref()
    }

    fn host_path(&self) -> Result<String, BuildError> {
        Ok(common::host_path(
            self.instance.spec.host_path_prefix.as_deref(),
            self.instance_namespace()?,
            self.instance_name()?,
        ))
    }

    /// Pod labels: the user's template labels with the system labels layered
    /// on top, so the system keys always win.
    fn labels(&self, role: &str) -> Result<BTreeMap<String, String>, BuildError> {
        let mut labels = self
            .template_metadata()
            .and_then(|meta| meta.labels.clone())
            .unwrap_or_default();
        labels.insert(
            common::LABEL_MANAGED_BY.to_string(),
            common::MANAGED_BY_VALUE.to_string(),
        );
        labels.insert(
            common::LABEL_INSTANCE.to_string(),
            self.instance_name()?.to_string(),
        );
        labels.insert(common::LABEL_ROLE.to_string(), role.to_string());
        Ok(labels)
    }

    /// Renders the provider pod: pause-init + rootfs sidecar + driver, no
    /// privilege bits anywhere.
    pub fn provider_pod(&self) -> Result<corev1::Pod, BuildError> {
        let name = self.instance_name()?;
        let workload = self.workload_container()?;
        if workload.image.is_none() {
            return Err(BuildError::MissingImage);
        }
        let host_path = self.host_path()?;

        Ok(corev1::Pod {
            metadata: metav1::ObjectMeta {
                name: Some(common::provider_pod_name(name)),
                namespace: Some(self.instance_namespace()?.to_string()),
                labels: Some(self.labels(common::ROLE_PROVIDER)?),
                owner_references: Some(vec![self.owner_reference()?]),
                ..metav1::ObjectMeta::default()
            },
            spec: Some(corev1::PodSpec {
                // The driver and the rootfs pause share one pid namespace so
                // the pod stays a single unit of inspection on the node.
                share_process_namespace: Some(true),
                restart_policy: Some("Always".to_string()),
                node_selector: self
                    .instance
                    .spec
                    .provider
                    .node_selector
                    .clone()
                    .or_else(|| self.template_spec().and_then(|s| s.node_selector.clone())),
                tolerations: self.instance.spec.provider.tolerations.clone(),
                init_containers: Some(vec![self.pause_init_container()]),
                containers: vec![self.driver_container(), self.rootfs_container(workload)],
                volumes: Some(vec![
                    host_path_volume(PROPAGATED_VOLUME, &host_path, "DirectoryOrCreate"),
                    empty_dir_volume(PAUSE_VOLUME),
                ]),
                image_pull_secrets: self
                    .template_spec()
                    .and_then(|s| s.image_pull_secrets.clone()),
                ..corev1::PodSpec::default()
            }),
            ..corev1::Pod::default()
        })
    }

    fn pause_init_container(&self) -> corev1::Container {
        corev1::Container {
            name: PAUSE_INIT_CONTAINER.to_string(),
            image: Some(self.config.wrapper_image.clone()),
            image_pull_policy: Some(self.config.wrapper_pull_policy.clone()),
            command: Some(vec![
                WRAPPER_EXEC_BIN.to_string(),
                "--copy".to_string(),
                WRAPPER_PAUSE_BIN.to_string(),
                PAUSE_BIN.to_string(),
            ]),
            volume_mounts: Some(vec![volume_mount(PAUSE_VOLUME, PAUSE_MOUNT_PATH, None)]),
            ..corev1::Container::default()
        }
    }

    fn driver_container(&self) -> corev1::Container {
        corev1::Container {
            name: DRIVER_CONTAINER.to_string(),
            image: Some(self.config.wrapper_image.clone()),
            image_pull_policy: Some(self.config.wrapper_pull_policy.clone()),
            command: Some(vec![WRAPPER_DRIVER_BIN.to_string()]),
            env: Some(vec![
                downward_env(POD_UID_ENV, "metadata.uid"),
                downward_env(POD_NAMESPACE_ENV, "metadata.namespace"),
                downward_env(POD_NAME_ENV, "metadata.name"),
            ]),
            resources: Some(self.provider_resources()),
            volume_mounts: Some(vec![volume_mount(
                PROPAGATED_VOLUME,
                PROPAGATED_MOUNT_PATH,
                Some("HostToContainer"),
            )]),
            readiness_probe: Some(exec_probe(
                vec![
                    WRAPPER_EXEC_BIN.to_string(),
                    "--check-file".to_string(),
                    format!("{}/ready", PROPAGATED_MOUNT_PATH),
                ],
                1,
                1,
                Some(120),
            )),
            liveness_probe: Some(exec_probe(
                vec![
                    WRAPPER_EXEC_BIN.to_string(),
                    "--check-dir".to_string(),
                    format!("{}/rootfs", PROPAGATED_MOUNT_PATH),
                ],
                30,
                10,
                None,
            )),
            ..corev1::Container::default()
        }
    }

    /// The rootfs sidecar runs the user's image but never its entrypoint:
    /// the injected static pause binary keeps it alive, which works for any
    /// image including scratch and distroless ones.
    fn rootfs_container(&self, workload: &corev1::Container) -> corev1::Container {
        corev1::Container {
            name: ROOTFS_CONTAINER.to_string(),
            image: workload.image.clone(),
            image_pull_policy: workload.image_pull_policy.clone(),
            command: Some(vec![PAUSE_BIN.to_string()]),
            env: Some(vec![corev1::EnvVar {
                name: ROOTFS_MARKER_ENV.to_string(),
                value: Some(ROOTFS_MARKER_VALUE.to_string()),
                ..corev1::EnvVar::default()
            }]),
            resources: Some(minimal_resources()),
            volume_mounts: Some(vec![
                volume_mount(PAUSE_VOLUME, PAUSE_MOUNT_PATH, None),
                volume_mount(PROPAGATED_VOLUME, HOST_MOUNT_PATH, Some("HostToContainer")),
            ]),
            ..corev1::Container::default()
        }
    }

    fn provider_resources(&self) -> corev1::ResourceRequirements {
        if let Some(resources) = &self.instance.spec.provider.resources {
            if resources.requests.is_some() || resources.limits.is_some() {
                return resources.clone();
            }
        }
        corev1::ResourceRequirements {
            requests: Some(resource_list("10m", "16Mi")),
            limits: Some(resource_list("100m", "64Mi")),
            ..corev1::ResourceRequirements::default()
        }
    }

    /// Renders the consumer pod, pinned to the provider's node.
    pub fn consumer_pod(&self, node_name: &str) -> Result<corev1::Pod, BuildError> {
        let name = self.instance_name()?;
        let workload = self.workload_container()?;
        let template_spec = self.template_spec().ok_or(BuildError::NoWorkloadContainer)?;
        let rootfs_host_path = format!("{}/rootfs", self.host_path()?);

        let workdir = workload
            .working_dir
            .clone()
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let mut command = vec![
            HELPER_BIN.to_string(),
            "--entrypoint".to_string(),
            workdir,
        ];
        command.extend(user_command(workload));

        let mut env = workload.env.clone().unwrap_or_default();
        env.push(corev1::EnvVar {
            name: CONSUMER_ROOTFS_ENV.to_string(),
            value: Some(ROOTFS_MOUNT_PATH.to_string()),
            ..corev1::EnvVar::default()
        });

        let mut init_containers = vec![self.exec_wrapper_init_container()];
        if let Some(user_inits) = &template_spec.init_containers {
            for init in user_inits {
                let mut init = init.clone();
                init.name = format!("user-{}", init.name);
                init_containers.push(init);
            }
        }

        Ok(corev1::Pod {
            metadata: metav1::ObjectMeta {
                name: Some(common::consumer_pod_name(name)),
                namespace: Some(self.instance_namespace()?.to_string()),
                labels: Some(self.labels(common::ROLE_CONSUMER)?),
                annotations: self.template_metadata().and_then(|m| m.annotations.clone()),
                owner_references: Some(vec![self.owner_reference()?]),
                ..metav1::ObjectMeta::default()
            },
            spec: Some(corev1::PodSpec {
                node_name: Some(node_name.to_string()),
                restart_policy: Some("Always".to_string()),
                service_account_name: template_spec.service_account_name.clone(),
                affinity: template_spec.affinity.clone(),
                tolerations: template_spec.tolerations.clone(),
                host_network: template_spec.host_network,
                dns_policy: template_spec.dns_policy.clone(),
                runtime_class_name: template_spec.runtime_class_name.clone(),
                init_containers: Some(init_containers),
                containers: vec![corev1::Container {
                    name: WORKLOAD_CONTAINER.to_string(),
                    // The trusted wrapper image, never the user image: the
                    // user's filesystem is entered by chroot, not by running
                    // its image again.
                    image: Some(self.config.wrapper_image.clone()),
                    image_pull_policy: Some(self.config.wrapper_pull_policy.clone()),
                    command: Some(command),
                    env: Some(env),
                    env_from: workload.env_from.clone(),
                    ports: workload.ports.clone(),
                    resources: workload.resources.clone(),
                    volume_mounts: Some(self.consumer_volume_mounts(workload)),
                    security_context: Some(consumer_security_context(
                        workload.security_context.as_ref(),
                    )),
                    readiness_probe: Some(exec_probe(
                        vec![HELPER_BIN.to_string(), "--ready".to_string()],
                        1,
                        5,
                        None,
                    )),
                    ..corev1::Container::default()
                }],
                volumes: Some(self.consumer_volumes(template_spec, &rootfs_host_path)),
                image_pull_secrets: template_spec.image_pull_secrets.clone(),
                ..corev1::PodSpec::default()
            }),
            ..corev1::Pod::default()
        })
    }

    fn exec_wrapper_init_container(&self) -> corev1::Container {
        corev1::Container {
            name: EXEC_WRAPPER_INIT_CONTAINER.to_string(),
            image: Some(self.config.wrapper_image.clone()),
            image_pull_policy: Some(self.config.wrapper_pull_policy.clone()),
            command: Some(vec![
                WRAPPER_EXEC_BIN.to_string(),
                "--init".to_string(),
                BIN_OVERLAY_SEED_PATH.to_string(),
            ]),
            volume_mounts: Some(vec![
                volume_mount(HELPER_VOLUME, HELPER_MOUNT_PATH, None),
                volume_mount(BIN_OVERLAY_VOLUME, BIN_OVERLAY_SEED_PATH, None),
            ]),
            resources: Some(corev1::ResourceRequirements {
                requests: Some(resource_list("10m", "16Mi")),
                limits: Some(resource_list("100m", "64Mi")),
                ..corev1::ResourceRequirements::default()
            }),
            ..corev1::Container::default()
        }
    }

    /// System mounts plus every user mount twice: once at the requested path
    /// and once underneath the rootfs mount, so the volume is visible at the
    /// same place after chroot.
    fn consumer_volume_mounts(&self, workload: &corev1::Container) -> Vec<corev1::VolumeMount> {
        let mut mounts = vec![
            volume_mount(
                PROPAGATED_VOLUME,
                ROOTFS_MOUNT_PATH,
                Some("HostToContainer"),
            ),
            volume_mount(HELPER_VOLUME, HELPER_MOUNT_PATH, None),
            volume_mount(BIN_OVERLAY_VOLUME, "/bin", None),
        ];

        if let Some(user_mounts) = &workload.volume_mounts {
            for m in user_mounts {
                let mut outside = m.clone();
                outside.name = format!("user-{}", m.name);
                mounts.push(outside);

                let mut inside = m.clone();
                inside.name = format!("user-{}-rootfs", m.name);
                inside.mount_path = format!("{}{}", ROOTFS_MOUNT_PATH, m.mount_path);
                mounts.push(inside);
            }
        }
        mounts
    }

    fn consumer_volumes(
        &self,
        template_spec: &corev1::PodSpec,
        rootfs_host_path: &str,
    ) -> Vec<corev1::Volume> {
        let mut volumes = vec![
            host_path_volume(PROPAGATED_VOLUME, rootfs_host_path, "Directory"),
            empty_dir_volume(HELPER_VOLUME),
            empty_dir_volume(BIN_OVERLAY_VOLUME),
        ];

        if let Some(user_volumes) = &template_spec.volumes {
            for v in user_volumes {
                let mut outside = v.clone();
                outside.name = format!("user-{}", v.name);
                volumes.push(outside);

                let mut inside = v.clone();
                inside.name = format!("user-{}-rootfs", v.name);
                volumes.push(inside);
            }
        }
        volumes
    }
}

/// The user's command and args, or a shell when neither is given.
fn user_command(workload: &corev1::Container) -> Vec<String> {
    let mut command = workload.command.clone().unwrap_or_default();
    command.extend(workload.args.clone().unwrap_or_default());
    if command.is_empty() {
        command.push("/bin/sh".to_string());
    }
    command
}

/// Only the chroot capability is required; user-requested additions are
/// unioned in, user drops are ignored because they would break the wrapper.
fn consumer_security_context(
    user: Option<&corev1::SecurityContext>,
) -> corev1::SecurityContext {
    let mut caps = CapabilitySet::new().union_with([CHROOT_CAPABILITY.to_string()]);
    let mut ctx = corev1::SecurityContext::default();

    if let Some(user) = user {
        ctx.run_as_group = user.run_as_group;
        if let Some(user_caps) = &user.capabilities {
            if let Some(add) = &user_caps.add {
                caps = caps.union_with(add.iter().cloned());
            }
        }
    }

    ctx.capabilities = Some(corev1::Capabilities {
        add: Some(caps.into_add_list()),
        drop: None,
    });
    ctx
}

fn volume_mount(
    name: &str,
    mount_path: &str,
    propagation: Option<&str>,
) -> corev1::VolumeMount {
    corev1::VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        mount_propagation: propagation.map(|p| p.to_string()),
        ..corev1::VolumeMount::default()
    }
}

fn host_path_volume(name: &str, path: &str, type_: &str) -> corev1::Volume {
    corev1::Volume {
        name: name.to_string(),
        host_path: Some(corev1::HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..corev1::Volume::default()
    }
}

fn empty_dir_volume(name: &str) -> corev1::Volume {
    corev1::Volume {
        name: name.to_string(),
        empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
        ..corev1::Volume::default()
    }
}

fn downward_env(name: &str, field_path: &str) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_string(),
        value_from: Some(corev1::EnvVarSource {
            field_ref: Some(corev1::ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..corev1::ObjectFieldSelector::default()
            }),
            ..corev1::EnvVarSource::default()
        }),
        ..corev1::EnvVar::default()
    }
}

fn exec_probe(
    command: Vec<String>,
    initial_delay: i32,
    period: i32,
    failure_threshold: Option<i32>,
) -> corev1::Probe {
    corev1::Probe {
        exec: Some(corev1::ExecAction {
            command: Some(command),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        failure_threshold,
        ..corev1::Probe::default()
    }
}

fn resource_list(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

fn minimal_resources() -> corev1::ResourceRequirements {
    corev1::ResourceRequirements {
        requests: Some(resource_list("1m", "4Mi")),
        limits: Some(resource_list("10m", "16Mi")),
        ..corev1::ResourceRequirements::default()
    }
}
