use std::io;
use std::path::PathBuf;

use stoppable_rendezvous::{ROOTFS_MARKER_ENV, ROOTFS_MARKER_VALUE};

/// Read-only view of the host process table.
///
/// The agent only ever needs three files per pid; hiding them behind a trait
/// lets the identification logic run against a scripted table in tests.
pub trait ProcessTable {
    fn pids(&self) -> io::Result<Vec<i32>>;
    fn cgroup(&self, pid: i32) -> io::Result<String>;
    fn environ(&self, pid: i32) -> io::Result<Vec<u8>>;
    fn mounts(&self, pid: i32) -> io::Result<String>;
}

/// The real `/proc`. Requires `hostPID`.
pub struct HostProc {
    root: PathBuf,
}

impl HostProc {
    pub fn new() -> Self {
        HostProc {
            root: PathBuf::from("/proc"),
        }
    }
}

impl Default for HostProc {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for HostProc {
    fn pids(&self) -> io::Result<Vec<i32>> {
        let mut pids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    fn cgroup(&self, pid: i32) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(pid.to_string()).join("cgroup"))
    }

    fn environ(&self, pid: i32) -> io::Result<Vec<u8>> {
        std::fs::read(self.root.join(pid.to_string()).join("environ"))
    }

    fn mounts(&self, pid: i32) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(pid.to_string()).join("mounts"))
    }
}

/// Finds the pid of the rootfs container for the given pod UID.
///
/// A process qualifies only when both signals agree: its cgroup path contains
/// the pod UID in the kubelet's `-`-to-`_` spelling, and its environment
/// carries the rootfs marker variable. The cgroup check narrows the scan to
/// the right pod; the marker is the authoritative signal. The lowest matching
/// pid wins, which by construction is the injected pause binary.
pub fn find_rootfs_container<P: ProcessTable>(table: &P, pod_uid: &str) -> Option<i32> {
    let cgroup_uid = pod_uid.replace('-', "_");
    let marker = format!("{}={}", ROOTFS_MARKER_ENV, ROOTFS_MARKER_VALUE);

    let mut pids = match table.pids() {
        Ok(pids) => pids,
        Err(_) => return None,
    };
    pids.sort_unstable();

    for pid in pids {
        // Processes may exit mid-scan; skip anything we can no longer read.
        let cgroup = match table.cgroup(pid) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if !cgroup.contains(&cgroup_uid) {
            continue;
        }
        let environ = match table.environ(pid) {
            Ok(e) => e,
            Err(_) => continue,
        };
        if environ
            .split(|b| *b == 0)
            .any(|entry| entry == marker.as_bytes())
        {
            return Some(pid);
        }
    }
    None
}
