use serde::{Deserialize, Serialize};

/// Mount request written by the provider driver.
pub const REQUEST_FILE: &str = "request.json";
/// Outcome written by the mount agent. The agent is the only writer.
pub const OUTCOME_FILE: &str = "ready.json";
/// Sentinel written by the driver once it has verified the mount; the
/// provider pod's readiness probe checks for this file.
pub const READY_SENTINEL: &str = "ready";
/// Directory inside the work directory where the overlay is mounted.
pub const ROOTFS_DIR: &str = "rootfs";

/// Environment variable planted on the rootfs container so the agent can
/// locate it by process inspection.
pub const ROOTFS_MARKER_ENV: &str = "ROOTFS_MARKER";
pub const ROOTFS_MARKER_VALUE: &str = "true";

/// Downward-API environment on the driver container.
pub const POD_UID_ENV: &str = "POD_UID";
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const POD_NAME_ENV: &str = "POD_NAME";

/// Contents of `request.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub pod_uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

/// Contents of `ready.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MountOutcome {
    Ready,
    Error {
        #[serde(default)]
        message: String,
    },
}

impl MountOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        MountOutcome::Error {
            message: message.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, MountOutcome::Ready)
    }
}
