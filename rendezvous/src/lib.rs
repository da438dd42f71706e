//! The filesystem rendezvous protocol shared by the provider driver and the
//! node mount agent.
//!
//! A provider pod asks its node's mount agent to recreate the rootfs overlay
//! by dropping `request.json` into the per-instance work directory; the agent
//! answers by writing `ready.json`. Only file presence and file contents are
//! used for ordering, never clocks. This crate is the single source for the
//! wire format, the well-known file names, and the environment variable names
//! both sides agree on.

mod channel;
mod protocol;

pub use channel::{ChannelError, FileChannel, MemoryChannel, MountChannel, Ticket};
pub use protocol::{
    MountOutcome, MountRequest, OUTCOME_FILE, POD_NAMESPACE_ENV, POD_NAME_ENV, POD_UID_ENV,
    READY_SENTINEL, REQUEST_FILE, ROOTFS_DIR, ROOTFS_MARKER_ENV, ROOTFS_MARKER_VALUE,
};
