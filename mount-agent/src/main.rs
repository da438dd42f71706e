use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use stoppable_mount_agent::{Agent, AgentConfig, HostProc, NixMounter};

/// Privileged per-node agent that recreates rootfs overlay mounts for
/// provider pods. Deployed as a DaemonSet with the host root bind-mounted,
/// hostPID, and bidirectional mount propagation.
#[derive(Parser)]
#[command(name = "stoppable-mount-agent")]
struct Args {
    /// Where the host root filesystem is mounted inside this container.
    #[arg(long, default_value = "/host")]
    host_root: PathBuf,

    /// Work directory base, as a host path.
    #[arg(long, default_value = "/var/lib/stoppablecontainer")]
    work_base: PathBuf,

    /// Container runtime state prefix rewritten through --host-root.
    #[arg(long, default_value = "/var/lib/containerd")]
    runtime_prefix: String,

    /// Seconds between scans of the work directory.
    #[arg(long, default_value_t = 2)]
    poll_interval: u64,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = AgentConfig {
        host_root: args.host_root,
        work_base: args.work_base,
        runtime_prefix: args.runtime_prefix,
        poll_interval: Duration::from_secs(args.poll_interval),
    };
    info!(
        host_root = %config.host_root.display(),
        work_base = %config.work_base.display(),
        "mount agent starting"
    );

    let agent = Agent::new(config, HostProc::new(), NixMounter);
    loop {
        if let Err(err) = agent.scan_once() {
            error!(error = %err, "error processing requests");
        }
        std::thread::sleep(agent.config().poll_interval);
    }
}
