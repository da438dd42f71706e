//! Transaction tests for the mount agent, run against a scripted process
//! table and recorded mount syscalls so no privileges are needed.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use stoppable_mount_agent::{Agent, AgentConfig, MountError, Mounter, ProcessTable};
use stoppable_rendezvous::{MountOutcome, MountRequest, OUTCOME_FILE, REQUEST_FILE};

const POD_UID: &str = "16b0c1b5-9f0e-4d9a-8b1c-6a33cf4d3cde";

#[derive(Default)]
struct FakeTable {
    processes: HashMap<i32, (String, Vec<u8>, String)>,
}

impl FakeTable {
    fn with_rootfs_container(pid: i32, mounts: &str) -> Self {
        let mut table = FakeTable::default();
        table.processes.insert(
            pid,
            (
                "0::/kubepods/burstable/pod16b0c1b5_9f0e_4d9a_8b1c_6a33cf4d3cde/abc".to_string(),
                b"PATH=/bin\0ROOTFS_MARKER=true\0".to_vec(),
                mounts.to_string(),
            ),
        );
        table
    }
}

impl ProcessTable for FakeTable {
    fn pids(&self) -> io::Result<Vec<i32>> {
        Ok(self.processes.keys().copied().collect())
    }

    fn cgroup(&self, pid: i32) -> io::Result<String> {
        self.processes
            .get(&pid)
            .map(|p| p.0.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn environ(&self, pid: i32) -> io::Result<Vec<u8>> {
        self.processes
            .get(&pid)
            .map(|p| p.1.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn mounts(&self, pid: i32) -> io::Result<String> {
        self.processes
            .get(&pid)
            .map(|p| p.2.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

#[derive(Default)]
struct FakeMounter {
    overlays: Mutex<Vec<(PathBuf, String)>>,
    binds: Mutex<Vec<(PathBuf, PathBuf, bool)>>,
    procs: Mutex<Vec<PathBuf>>,
    fail_overlay: bool,
}

impl FakeMounter {
    fn failing() -> Self {
        FakeMounter {
            fail_overlay: true,
            ..FakeMounter::default()
        }
    }

    fn overlay_options_for(&self, target: &Path) -> Option<String> {
        self.overlays
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, o)| o.clone())
    }
}

impl Mounter for FakeMounter {
    fn mount_overlay(&self, target: &Path, options: &str) -> Result<(), MountError> {
        if self.fail_overlay {
            return Err(MountError::Syscall {
                target: target.to_path_buf(),
                source: io::Error::from_raw_os_error(16), // EBUSY
            });
        }
        self.overlays
            .lock()
            .unwrap()
            .push((target.to_path_buf(), options.to_string()));
        Ok(())
    }

    fn mount_proc(&self, target: &Path) -> Result<(), MountError> {
        self.procs.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> Result<(), MountError> {
        self.binds
            .lock()
            .unwrap()
            .push((source.to_path_buf(), target.to_path_buf(), recursive));
        Ok(())
    }

    fn make_recursive_slave(&self, _target: &Path) -> Result<(), MountError> {
        Ok(())
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    host_root: PathBuf,
    workdir: PathBuf,
}

/// Lays out `<host_root>/var/lib/stoppablecontainer/default/demo/` with a
/// pending request, the way the provider's hostPath volume and driver do.
fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let host_root = tmp.path().join("host");
    let workdir = host_root.join("var/lib/stoppablecontainer/default/demo");
    std::fs::create_dir_all(&workdir).unwrap();

    let request = MountRequest {
        pod_uid: POD_UID.to_string(),
        namespace: "default".to_string(),
        name: "demo-provider".to_string(),
    };
    std::fs::write(
        workdir.join(REQUEST_FILE),
        serde_json::to_vec(&request).unwrap(),
    )
    .unwrap();

    Fixture {
        _tmp: tmp,
        host_root,
        workdir,
    }
}

fn config(host_root: &Path) -> AgentConfig {
    AgentConfig {
        host_root: host_root.to_path_buf(),
        work_base: PathBuf::from("/var/lib/stoppablecontainer"),
        runtime_prefix: "/var/lib/containerd".to_string(),
        poll_interval: Duration::from_secs(2),
    }
}

fn read_outcome(workdir: &Path) -> MountOutcome {
    let data = std::fs::read(workdir.join(OUTCOME_FILE)).unwrap();
    serde_json::from_slice(&data).unwrap()
}

const CONTAINER_MOUNTS: &str = "\
overlay / overlay rw,relatime,lowerdir=/var/lib/containerd/s/1/fs:/var/lib/containerd/s/2/fs,upperdir=/var/lib/containerd/s/9/fs,workdir=/var/lib/containerd/s/9/work 0 0
proc /proc proc rw,nosuid 0 0
";

#[test]
fn successful_request_mounts_overlay_and_commits() {
    let fx = fixture();
    let table = FakeTable::with_rootfs_container(42, CONTAINER_MOUNTS);
    let mounter = FakeMounter::default();
    let agent = Agent::new(config(&fx.host_root), table, mounter);

    agent.scan_once().unwrap();

    // Committed: request removed, ready written.
    assert!(!fx.workdir.join(REQUEST_FILE).exists());
    assert!(read_outcome(&fx.workdir).is_ready());

    // Overlay mounted at <workdir>/rootfs with rehosted options.
    let rootfs = fx.workdir.join("rootfs");
    assert!(rootfs.is_dir());
    let options = agent
        .mounter()
        .overlay_options_for(&rootfs)
        .expect("overlay mounted");
    let host_prefix = format!("{}/var/lib/containerd", fx.host_root.display());
    assert!(options.contains(&format!("upperdir={}/s/9/fs", host_prefix)));
    assert!(!options.contains("upperdir=/var/lib/containerd"));

    // Pseudo-filesystems installed.
    assert_eq!(agent.mounter().procs.lock().unwrap().len(), 1);
    let binds = agent.mounter().binds.lock().unwrap();
    assert!(binds
        .iter()
        .any(|(s, t, rec)| s.ends_with("dev") && t == &rootfs.join("dev") && *rec));
    assert!(binds
        .iter()
        .any(|(s, t, rec)| s.ends_with("sys") && t == &rootfs.join("sys") && *rec));
    drop(binds);
    assert!(rootfs.join("tmp").is_dir());
}

#[test]
fn unknown_pod_uid_reports_error_and_keeps_request() {
    let fx = fixture();
    let agent = Agent::new(
        config(&fx.host_root),
        FakeTable::default(),
        FakeMounter::default(),
    );

    agent.scan_once().unwrap();

    assert!(fx.workdir.join(REQUEST_FILE).exists());
    match read_outcome(&fx.workdir) {
        MountOutcome::Error { message } => {
            assert!(message.contains("rootfs container not found"))
        }
        other => panic!("expected error outcome, got {:?}", other),
    }
    assert!(agent.mounter().overlays.lock().unwrap().is_empty());
}

#[test]
fn mount_failure_reports_error() {
    let fx = fixture();
    let table = FakeTable::with_rootfs_container(42, CONTAINER_MOUNTS);
    let agent = Agent::new(config(&fx.host_root), table, FakeMounter::failing());

    agent.scan_once().unwrap();

    assert!(fx.workdir.join(REQUEST_FILE).exists());
    match read_outcome(&fx.workdir) {
        MountOutcome::Error { message } => assert!(message.contains("failed to mount overlay")),
        other => panic!("expected error outcome, got {:?}", other),
    }
}

#[test]
fn missing_overlay_line_reports_error() {
    let fx = fixture();
    let table = FakeTable::with_rootfs_container(42, "proc /proc proc rw 0 0\n");
    let agent = Agent::new(config(&fx.host_root), table, FakeMounter::default());

    agent.scan_once().unwrap();

    match read_outcome(&fx.workdir) {
        MountOutcome::Error { message } => assert!(message.contains("overlayfs mount not found")),
        other => panic!("expected error outcome, got {:?}", other),
    }
}

#[test]
fn malformed_request_reports_error() {
    let fx = fixture();
    std::fs::write(fx.workdir.join(REQUEST_FILE), b"not json").unwrap();
    let agent = Agent::new(
        config(&fx.host_root),
        FakeTable::default(),
        FakeMounter::default(),
    );

    agent.scan_once().unwrap();

    match read_outcome(&fx.workdir) {
        MountOutcome::Error { message } => assert!(message.contains("failed to parse request")),
        other => panic!("expected error outcome, got {:?}", other),
    }
}

#[test]
fn directories_without_requests_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let host_root = tmp.path().join("host");
    let idle = host_root.join("var/lib/stoppablecontainer/default/idle");
    std::fs::create_dir_all(&idle).unwrap();

    let agent = Agent::new(
        config(&host_root),
        FakeTable::default(),
        FakeMounter::default(),
    );
    agent.scan_once().unwrap();

    assert!(!idle.join(OUTCOME_FILE).exists());
}

#[test]
fn missing_work_base_is_not_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = Agent::new(
        config(&tmp.path().join("host")),
        FakeTable::default(),
        FakeMounter::default(),
    );
    agent.scan_once().unwrap();
}
