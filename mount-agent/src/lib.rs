//! Node-local mount agent.
//!
//! Runs privileged, one per node, with the host root filesystem bind-mounted
//! at a fixed path and a mount namespace that propagates bidirectionally to
//! the host. It polls the per-node work directory for `request.json` files
//! dropped by provider drivers, locates the live rootfs of the requesting
//! pod's rootfs container by inspecting `/proc`, recreates that container's
//! overlay mount at a stable host path, installs kernel pseudo-filesystems
//! inside it, and answers through `ready.json`.

pub mod agent;
pub mod mounts;
pub mod overlay;
pub mod procfs;

pub use agent::{Agent, AgentConfig, AgentError};
pub use mounts::{MountError, Mounter, NixMounter};
pub use procfs::{HostProc, ProcessTable};
