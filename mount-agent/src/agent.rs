use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, warn};

use stoppable_rendezvous::{MountOutcome, MountRequest, OUTCOME_FILE, REQUEST_FILE, ROOTFS_DIR};

use crate::mounts::{MountError, Mounter};
use crate::overlay::{self, OverlayError};
use crate::procfs::{find_rootfs_container, ProcessTable};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Where the host root filesystem is mounted inside the agent container.
    pub host_root: PathBuf,
    /// Work directory base, as a host path.
    pub work_base: PathBuf,
    /// Container runtime state prefix to rewrite through `host_root`.
    pub runtime_prefix: String,
    /// Delay between scans of the work directory.
    pub poll_interval: Duration,
}

impl AgentConfig {
    /// The work base as seen from inside the agent container.
    pub fn host_work_base(&self) -> PathBuf {
        join_under(&self.host_root, &self.work_base)
    }
}

fn join_under(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(rel) => root.join(rel),
        Err(_) => root.join(path),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to read request: {0}")]
    ReadRequest(#[source] io::Error),

    #[error("failed to parse request: {0}")]
    ParseRequest(#[source] serde_json::Error),

    #[error("rootfs container not found for pod {0}")]
    RootfsContainerNotFound(String),

    #[error("failed to read mounts of pid {pid}: {source}")]
    ReadMounts {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to get overlayfs options: {0}")]
    Overlay(#[from] OverlayError),

    #[error("failed to create rootfs dir: {0}")]
    CreateRootfsDir(#[source] io::Error),

    #[error("failed to mount overlay: {0}")]
    MountOverlay(#[source] MountError),
}

/// One mount agent over a process table and a set of mount syscalls.
pub struct Agent<P, M> {
    config: AgentConfig,
    proc_table: P,
    mounter: M,
}

impl<P: ProcessTable, M: Mounter> Agent<P, M> {
    pub fn new(config: AgentConfig, proc_table: P, mounter: M) -> Self {
        Agent {
            config,
            proc_table,
            mounter,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Scans the work directory tree once and processes every pending
    /// request. The layout is `<base>/<namespace>/<name>/request.json`.
    pub fn scan_once(&self) -> io::Result<()> {
        let base = self.config.host_work_base();
        let namespaces = match std::fs::read_dir(&base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        for ns_entry in namespaces.flatten() {
            if !is_valid_workdir_entry(&ns_entry) {
                continue;
            }
            let instances = match std::fs::read_dir(ns_entry.path()) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in instances.flatten() {
                if !is_valid_workdir_entry(&entry) {
                    continue;
                }
                let workdir = entry.path();
                if !workdir.join(REQUEST_FILE).exists() {
                    continue;
                }

                info!(workdir = %workdir.display(), "found mount request");
                if let Err(err) = self.process(&workdir) {
                    error!(workdir = %workdir.display(), error = %err, "failed to process request");
                    // Leave request.json in place so the driver can retry
                    // after clearing the error marker.
                    if let Err(write_err) =
                        write_outcome(&workdir, &MountOutcome::error(err.to_string()))
                    {
                        error!(
                            workdir = %workdir.display(),
                            error = %write_err,
                            "failed to write error outcome"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Processes one request transactionally: either the overlay ends up
    /// mounted and `ready.json` says so, or nothing new is mounted and
    /// `ready.json` carries the error.
    pub fn process(&self, workdir: &Path) -> Result<(), AgentError> {
        let request_path = workdir.join(REQUEST_FILE);
        let data = std::fs::read(&request_path).map_err(AgentError::ReadRequest)?;
        let request: MountRequest =
            serde_json::from_slice(&data).map_err(AgentError::ParseRequest)?;

        info!(pod_uid = %request.pod_uid, "processing request");

        let pid = find_rootfs_container(&self.proc_table, &request.pod_uid)
            .ok_or_else(|| AgentError::RootfsContainerNotFound(request.pod_uid.clone()))?;
        info!(pid, "found rootfs container");

        let mounts = self
            .proc_table
            .mounts(pid)
            .map_err(|source| AgentError::ReadMounts { pid, source })?;
        let options = overlay::overlay_options(&mounts)?;

        let host_root = self.config.host_root.to_string_lossy();
        let rehosted = overlay::rehost(&options, &self.config.runtime_prefix, &host_root);
        info!(options = %rehosted, "got overlayfs options");

        let rootfs = workdir.join(ROOTFS_DIR);
        make_dir_mode(&rootfs, 0o755).map_err(AgentError::CreateRootfsDir)?;

        self.mounter
            .mount_overlay(&rootfs, &rehosted)
            .map_err(AgentError::MountOverlay)?;
        info!("mounted overlay");

        // Pseudo-filesystem failures are reported but do not abort: the
        // consumer entrypoint re-attempts what it can.
        let setup_errors = self.install_pseudo_filesystems(&rootfs);
        if !setup_errors.is_empty() {
            warn!(
                errors = %setup_errors.join("; "),
                "failed to mount some special filesystems"
            );
        }

        if let Err(err) = std::fs::remove_file(&request_path) {
            warn!(error = %err, "failed to remove request file");
        }
        if let Err(err) = write_outcome(workdir, &MountOutcome::Ready) {
            warn!(error = %err, "failed to write ready outcome");
        }

        info!(workdir = %workdir.display(), "mount complete");
        Ok(())
    }

    /// Installs `proc`, `dev`, `sys`, `dev/pts`, `dev/shm`, and `tmp` inside
    /// the freshly mounted rootfs. Returns the collected error messages.
    fn install_pseudo_filesystems(&self, rootfs: &Path) -> Vec<String> {
        let mut errs = Vec::new();

        let proc_dir = rootfs.join("proc");
        if let Err(e) = make_dir_mode(&proc_dir, 0o755) {
            errs.push(format!("mkdir proc: {}", e));
        } else if let Err(e) = self.mounter.mount_proc(&proc_dir) {
            errs.push(format!("proc: {}", e));
        }

        for name in ["dev", "sys"] {
            let target = rootfs.join(name);
            let source = self.config.host_root.join(name);
            if let Err(e) = make_dir_mode(&target, 0o755) {
                errs.push(format!("mkdir {}: {}", name, e));
                continue;
            }
            if let Err(e) = self.mounter.bind(&source, &target, true) {
                errs.push(format!("{}: {}", name, e));
                continue;
            }
            // Recursive-slave immediately so nothing leaks back to the host.
            let _ = self.mounter.make_recursive_slave(&target);
        }

        for name in ["dev/pts", "dev/shm"] {
            let source = join_under(&self.config.host_root, Path::new(name));
            if !source.exists() {
                continue;
            }
            let target = rootfs.join(name);
            if make_dir_mode(&target, 0o755).is_ok() {
                let _ = self.mounter.bind(&source, &target, false);
            }
        }

        let tmp = rootfs.join("tmp");
        if let Err(e) = make_dir_mode(&tmp, 0o1777) {
            errs.push(format!("mkdir tmp: {}", e));
        }

        errs
    }
}

fn is_valid_workdir_entry(entry: &std::fs::DirEntry) -> bool {
    if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
        return false;
    }
    match entry.file_name().to_str() {
        Some(name) => !name.is_empty() && name != ".." && !name.contains('/'),
        None => false,
    }
}

fn make_dir_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn write_outcome(workdir: &Path, outcome: &MountOutcome) -> io::Result<()> {
    let data = serde_json::to_vec(outcome)?;
    let path = workdir.join(OUTCOME_FILE);
    std::fs::write(&path, data)?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}
