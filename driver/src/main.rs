//! Driver process for the provider pod.
//!
//! Submits a mount request over the filesystem rendezvous, waits for the
//! node agent's answer, verifies the mounted rootfs, writes the readiness
//! sentinel the kubelet probe checks, and then parks until the pod is
//! terminated. The rootfs sidecar in the same pod keeps the user image's
//! overlay alive the whole time.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use stoppable_rendezvous::{
    FileChannel, MountChannel, MountOutcome, MountRequest, POD_NAMESPACE_ENV, POD_NAME_ENV,
    POD_UID_ENV, READY_SENTINEL, ROOTFS_DIR,
};

/// Where the per-instance hostPath volume is mounted in the driver container.
const PROPAGATED_PATH: &str = "/propagated";

const MAX_ATTEMPTS: u32 = 3;
const OUTCOME_TIMEOUT: Duration = Duration::from_secs(150);

#[derive(Debug, thiserror::Error)]
enum DriverError {
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),

    #[error("failed to set up mount after {attempts} attempts: {last_error}")]
    MountFailed { attempts: u32, last_error: String },

    #[error("rootfs directory not found at {0}")]
    RootfsMissing(PathBuf),

    #[error("rootfs appears empty, no /bin or /usr/bin found")]
    RootfsEmpty,
}

fn request_from_env() -> Result<MountRequest, DriverError> {
    let pod_uid = std::env::var(POD_UID_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(DriverError::MissingEnv(POD_UID_ENV))?;
    Ok(MountRequest {
        pod_uid,
        namespace: std::env::var(POD_NAMESPACE_ENV).unwrap_or_default(),
        name: std::env::var(POD_NAME_ENV).unwrap_or_default(),
    })
}

/// Runs the request/await/verify sequence up to [`MAX_ATTEMPTS`] times.
/// Each retry goes through `submit`, which clears the previous `ready.json`
/// so the agent reprocesses the request from scratch.
fn establish_mount<C: MountChannel>(
    channel: &C,
    workdir: &Path,
    request: &MountRequest,
) -> Result<(), DriverError> {
    let mut last_error = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            info!(attempt, max = MAX_ATTEMPTS, "retrying mount setup");
            std::thread::sleep(Duration::from_secs(1));
        }

        info!("writing mount request");
        let ticket = match channel.submit(request) {
            Ok(ticket) => ticket,
            Err(err) => {
                last_error = err.to_string();
                continue;
            }
        };

        match channel.await_outcome(ticket, OUTCOME_TIMEOUT) {
            Ok(MountOutcome::Ready) => match verify_rootfs(&workdir.join(ROOTFS_DIR)) {
                Ok(()) => {
                    info!("rootfs mounted successfully");
                    return Ok(());
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            },
            Ok(MountOutcome::Error { message }) => {
                last_error = format!("mount failed: {}", message);
            }
            Err(err) => {
                last_error = err.to_string();
            }
        }
    }

    Err(DriverError::MountFailed {
        attempts: MAX_ATTEMPTS,
        last_error,
    })
}

/// The agent said ready; make sure the mount actually propagated and looks
/// like a root filesystem before declaring the pod ready.
fn verify_rootfs(rootfs: &Path) -> Result<(), DriverError> {
    if !rootfs.is_dir() {
        return Err(DriverError::RootfsMissing(rootfs.to_path_buf()));
    }
    if !rootfs.join("bin").exists() && !rootfs.join("usr/bin").exists() {
        return Err(DriverError::RootfsEmpty);
    }
    Ok(())
}

fn write_ready_sentinel(workdir: &Path) -> io::Result<()> {
    let path = workdir.join(READY_SENTINEL);
    std::fs::write(&path, b"ready\n")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

fn wait_for_termination() {
    use nix::sys::signal::{SigSet, Signal};
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGINT);
    if signals.thread_block().is_ok() {
        let _ = signals.wait();
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("provider driver starting");

    let request = request_from_env()?;
    let workdir = PathBuf::from(PROPAGATED_PATH);
    let channel = FileChannel::new(&workdir);

    establish_mount(&channel, &workdir, &request)?;

    if let Err(err) = write_ready_sentinel(&workdir) {
        warn!(error = %err, "failed to write ready sentinel");
    }

    info!("provider ready, waiting for termination signal");
    wait_for_termination();
    info!("received termination signal, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoppable_rendezvous::MemoryChannel;

    fn request() -> MountRequest {
        MountRequest {
            pod_uid: "uid-1".to_string(),
            namespace: "default".to_string(),
            name: "demo-provider".to_string(),
        }
    }

    fn workdir_with_rootfs() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("rootfs/bin")).unwrap();
        tmp
    }

    #[test]
    fn succeeds_on_first_ready_outcome() {
        let tmp = workdir_with_rootfs();
        let channel = MemoryChannel::new();
        channel.push_outcome(MountOutcome::Ready);

        establish_mount(&channel, tmp.path(), &request()).unwrap();
        assert_eq!(channel.submitted().len(), 1);
    }

    #[test]
    fn retries_after_error_outcome() {
        let tmp = workdir_with_rootfs();
        let channel = MemoryChannel::new();
        channel.push_outcome(MountOutcome::error("rootfs container not found"));
        channel.push_outcome(MountOutcome::Ready);

        establish_mount(&channel, tmp.path(), &request()).unwrap();
        assert_eq!(channel.submitted().len(), 2);
    }

    #[test]
    fn gives_up_after_three_failed_attempts() {
        let tmp = workdir_with_rootfs();
        let channel = MemoryChannel::new();
        for _ in 0..3 {
            channel.push_outcome(MountOutcome::error("mount syscall failed"));
        }

        let err = establish_mount(&channel, tmp.path(), &request()).unwrap_err();
        assert_eq!(channel.submitted().len(), 3);
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(err.to_string().contains("mount syscall failed"));
    }

    #[test]
    fn ready_outcome_with_empty_rootfs_counts_as_failure() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("rootfs")).unwrap();
        let channel = MemoryChannel::new();
        for _ in 0..3 {
            channel.push_outcome(MountOutcome::Ready);
        }

        let err = establish_mount(&channel, tmp.path(), &request()).unwrap_err();
        assert!(err.to_string().contains("appears empty"));
    }

    #[test]
    fn usr_bin_satisfies_rootfs_verification() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("rootfs/usr/bin")).unwrap();
        let channel = MemoryChannel::new();
        channel.push_outcome(MountOutcome::Ready);

        establish_mount(&channel, tmp.path(), &request()).unwrap();
    }

    #[test]
    fn sentinel_is_plain_ready_text() {
        let tmp = tempfile::tempdir().unwrap();
        write_ready_sentinel(tmp.path()).unwrap();
        let contents = std::fs::read_to_string(tmp.path().join(READY_SENTINEL)).unwrap();
        assert_eq!(contents, "ready\n");
    }
}
