//! The individual steps behind the helper's verbs, split out so each is
//! testable without a running pod.

use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

/// Where the rootfs hostPath volume is mounted in the consumer container.
pub const ROOTFS_PATH: &str = "/rootfs";
/// Where the helper installs itself for the workload container to call.
pub const HELPER_DIR: &str = "/.stoppable-bin";
pub const HELPER_NAME: &str = "stoppable-exec";

const SERVICE_ACCOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const SEARCH_PATHS: [&str; 6] = [
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

/// Commands linked into the `/bin` overlay so `kubectl exec` lands in the
/// helper transparently.
const OVERLAY_COMMANDS: [&str; 46] = [
    "sh", "bash", "zsh", "ash", "dash", "ksh", "fish", "cat", "ls", "pwd", "id", "whoami",
    "uname", "hostname", "env", "printenv", "grep", "awk", "sed", "head", "tail", "echo", "test",
    "[", "cp", "mkdir", "rm", "mv", "touch", "chmod", "chown", "date", "sleep", "true", "false",
    "python", "python3", "node", "npm", "ruby", "perl", "java", "apt", "apt-get", "dnf", "apk",
];

#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    #[error("rootfs not ready at {0} after {1} attempts")]
    RootfsNotReady(PathBuf, u32),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("failed to chroot into {path}: {source}")]
    Chroot {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to exec {path}: {source}")]
    Exec {
        path: String,
        #[source]
        source: nix::Error,
    },

    #[error("command contains an interior NUL byte")]
    NulInCommand(#[from] std::ffi::NulError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Readiness check: the rootfs is mounted, looks like a root filesystem, and
/// the agent has finished installing `proc` inside it.
pub fn rootfs_ready(rootfs: &Path, proc_mounts: &str) -> bool {
    has_bin_dir(rootfs) && is_mounted(&rootfs.join("proc"), proc_mounts)
}

/// Accepts both directories and symlinks; some images link `/bin -> usr/bin`.
fn has_bin_dir(rootfs: &Path) -> bool {
    for rel in ["bin", "usr/bin"] {
        if let Ok(meta) = std::fs::symlink_metadata(rootfs.join(rel)) {
            if meta.is_dir() || meta.file_type().is_symlink() {
                return true;
            }
        }
    }
    false
}

/// Checks a mount table (the caller reads `/proc/mounts`) for an exact
/// mount-point match.
pub fn is_mounted(path: &Path, proc_mounts: &str) -> bool {
    let want = path.to_string_lossy();
    proc_mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next().is_some() && fields.next() == Some(want.as_ref())
    })
}

fn read_proc_mounts() -> String {
    std::fs::read_to_string("/proc/mounts").unwrap_or_default()
}

/// Entrypoint mode: wait for the mount, install network configuration and
/// the service-account token, chroot, and exec the user command. Only
/// returns on failure.
pub fn run_entrypoint(workdir: &str, command: &[String]) -> WrapperError {
    let rootfs = Path::new(ROOTFS_PATH);

    if let Err(err) = wait_for_rootfs(rootfs) {
        return err;
    }
    info!("rootfs ready with mounts from node agent");

    copy_network_config(rootfs);
    mount_service_account_token(rootfs);

    info!("setup complete, chrooting");
    if let Err(source) = nix::unistd::chroot(rootfs) {
        return WrapperError::Chroot {
            path: rootfs.to_path_buf(),
            source,
        };
    }
    if let Err(err) = std::env::set_current_dir("/") {
        return WrapperError::Io(err);
    }
    if !workdir.is_empty() && workdir != "/" {
        if let Err(err) = std::env::set_current_dir(workdir) {
            debug!(workdir, error = %err, "could not change to working directory");
        }
    }

    let binary = match resolve_command(Path::new("/"), &command[0]) {
        Some(path) => path,
        None => return WrapperError::CommandNotFound(command[0].clone()),
    };

    exec(&binary, command)
}

fn exec(binary: &str, command: &[String]) -> WrapperError {
    let prog = match CString::new(binary) {
        Ok(c) => c,
        Err(e) => return WrapperError::NulInCommand(e),
    };
    let args: Result<Vec<CString>, _> = command.iter().map(|a| CString::new(a.as_str())).collect();
    let args = match args {
        Ok(a) => a,
        Err(e) => return WrapperError::NulInCommand(e),
    };
    match nix::unistd::execv(&prog, &args) {
        Ok(infallible) => match infallible {},
        Err(source) => WrapperError::Exec {
            path: binary.to_string(),
            source,
        },
    }
}

fn wait_for_rootfs(rootfs: &Path) -> Result<(), WrapperError> {
    const MAX_ATTEMPTS: u32 = 120;
    for attempt in 0..MAX_ATTEMPTS {
        if rootfs_ready(rootfs, &read_proc_mounts()) {
            return Ok(());
        }
        if attempt < 10 {
            std::thread::sleep(Duration::from_millis(200));
        } else {
            if attempt % 10 == 0 {
                info!(attempt, max = MAX_ATTEMPTS, "waiting for rootfs setup");
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
    Err(WrapperError::RootfsNotReady(
        rootfs.to_path_buf(),
        MAX_ATTEMPTS,
    ))
}

/// Copies `/etc/resolv.conf` and `/etc/hosts` into the rootfs so name
/// resolution inside the chroot matches the pod.
pub fn copy_network_config(rootfs: &Path) {
    for config in ["/etc/resolv.conf", "/etc/hosts"] {
        let source = Path::new(config);
        if !source.exists() {
            continue;
        }
        let target = join_rooted(rootfs, config);
        if let Some(parent) = target.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::copy(source, &target) {
            debug!(config, error = %err, "failed to copy network config");
        }
    }
}

/// Bind-mounts the service-account token directory into the rootfs, falling
/// back to a plain copy when the bind fails. Honors images where `/var/run`
/// is a symlink to `/run`.
pub fn mount_service_account_token(rootfs: &Path) {
    let source = Path::new(SERVICE_ACCOUNT_PATH);
    if !source.is_dir() {
        return;
    }

    let target = service_account_target(rootfs);
    if std::fs::create_dir_all(&target).is_err() {
        return;
    }

    let bound = nix::mount::mount(
        Some(source),
        &target,
        None::<&str>,
        nix::mount::MsFlags::MS_BIND,
        None::<&str>,
    )
    .is_ok();
    if bound {
        return;
    }

    debug!("bind mount failed, copying service account token");
    if let Ok(entries) = std::fs::read_dir(source) {
        for entry in entries.flatten() {
            let _ = std::fs::copy(entry.path(), target.join(entry.file_name()));
        }
    }
}

pub fn service_account_target(rootfs: &Path) -> PathBuf {
    let var_run = rootfs.join("var/run");
    if let Ok(meta) = std::fs::symlink_metadata(&var_run) {
        if meta.file_type().is_symlink() {
            return rootfs.join("run/secrets/kubernetes.io/serviceaccount");
        }
    }
    join_rooted(rootfs, SERVICE_ACCOUNT_PATH)
}

/// Resolves a command name against a rootfs: absolute paths are checked
/// directly, bare names walk the standard search paths. Returns the path as
/// seen from inside the rootfs.
pub fn resolve_command(rootfs: &Path, name: &str) -> Option<String> {
    if name.starts_with('/') {
        if join_rooted(rootfs, name).exists() {
            return Some(name.to_string());
        }
        return None;
    }
    for dir in SEARCH_PATHS {
        let candidate = format!("{}/{}", dir, name);
        if join_rooted(rootfs, &candidate).exists() {
            return Some(candidate);
        }
    }
    None
}

fn join_rooted(rootfs: &Path, absolute: &str) -> PathBuf {
    rootfs.join(absolute.trim_start_matches('/'))
}

/// Init mode: install the helper into the shared bin volume and seed the
/// `/bin` overlay with symlinks pointing at it.
pub fn run_init(overlay: &Path) -> Result<(), WrapperError> {
    info!("setting up /bin overlay for transparent chroot execution");
    let helper = install_helper(Path::new(HELPER_DIR))?;
    seed_overlay(&helper, overlay);
    info!("setup complete");
    Ok(())
}

/// Copies the running executable into `dest_dir` as the canonical helper.
pub fn install_helper(dest_dir: &Path) -> Result<PathBuf, WrapperError> {
    std::fs::create_dir_all(dest_dir)?;
    let own = std::env::current_exe()?;
    let dest = dest_dir.join(HELPER_NAME);
    copy_executable(&own, &dest)?;
    Ok(dest)
}

pub fn seed_overlay(helper: &Path, overlay: &Path) {
    for command in OVERLAY_COMMANDS {
        let link = overlay.join(command);
        if let Err(err) = std::os::unix::fs::symlink(helper, &link) {
            if err.kind() != io::ErrorKind::AlreadyExists {
                warn!(command, error = %err, "failed to create symlink");
            }
        }
    }
}

/// Copy mode: copy a file and mark it executable.
pub fn copy_executable(src: &Path, dst: &Path) -> Result<(), WrapperError> {
    let data = std::fs::read(src)?;
    std::fs::write(dst, data)?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}
