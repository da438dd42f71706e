use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("mount {target} failed: {source}")]
    Syscall {
        target: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The mount syscalls the agent issues, behind a seam so the transaction
/// logic is testable without privileges.
pub trait Mounter {
    /// `mount -t overlay overlay -o <options> <target>`
    fn mount_overlay(&self, target: &Path, options: &str) -> Result<(), MountError>;

    /// Mounts a fresh `proc` at `target`.
    fn mount_proc(&self, target: &Path) -> Result<(), MountError>;

    /// Bind-mounts `source` onto `target`, recursively when asked.
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> Result<(), MountError>;

    /// Remounts `target` recursive-slave so child mounts cannot leak back to
    /// the host.
    fn make_recursive_slave(&self, target: &Path) -> Result<(), MountError>;
}

/// Production implementation over `nix::mount`.
pub struct NixMounter;

impl NixMounter {
    fn syscall_err(target: &Path, errno: nix::Error) -> MountError {
        MountError::Syscall {
            target: target.to_path_buf(),
            source: io::Error::from_raw_os_error(errno as i32),
        }
    }
}

impl Mounter for NixMounter {
    fn mount_overlay(&self, target: &Path, options: &str) -> Result<(), MountError> {
        nix::mount::mount(
            Some("overlay"),
            target,
            Some("overlay"),
            nix::mount::MsFlags::empty(),
            Some(options),
        )
        .map_err(|e| Self::syscall_err(target, e))
    }

    fn mount_proc(&self, target: &Path) -> Result<(), MountError> {
        nix::mount::mount(
            Some("proc"),
            target,
            Some("proc"),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| Self::syscall_err(target, e))
    }

    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> Result<(), MountError> {
        let mut flags = nix::mount::MsFlags::MS_BIND;
        if recursive {
            flags |= nix::mount::MsFlags::MS_REC;
        }
        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>)
            .map_err(|e| Self::syscall_err(target, e))
    }

    fn make_recursive_slave(&self, target: &Path) -> Result<(), MountError> {
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            nix::mount::MsFlags::MS_SLAVE | nix::mount::MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| Self::syscall_err(target, e))
    }
}
