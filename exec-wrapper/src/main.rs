//! Helper binary for the consumer pod.
//!
//! Runs with explicit verbs so each behavior is scriptable from pod specs
//! and probes. The argv shapes are a contract with the pod builder:
//!
//! ```text
//! stoppable-exec --ready
//! stoppable-exec --entrypoint <workdir> <command...>
//! stoppable-exec --init <overlay-path>
//! stoppable-exec --copy <src> <dst>
//! stoppable-exec --check-file <path>
//! stoppable-exec --check-dir <path>
//! ```

mod steps;

use std::path::Path;
use std::process::exit;

use tracing::error;

fn main() {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("--ready") => {
            let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
            if steps::rootfs_ready(Path::new(steps::ROOTFS_PATH), &mounts) {
                exit(0);
            }
            exit(1);
        }
        Some("--entrypoint") => {
            if args.len() < 4 {
                fatal_usage("--entrypoint <workdir> <command...>");
            }
            // Only returns on failure; on success the user command replaces
            // this process.
            let err = steps::run_entrypoint(&args[2], &args[3..]);
            error!(error = %err, "entrypoint failed");
            exit(1);
        }
        Some("--init") => {
            if args.len() < 3 {
                fatal_usage("--init <overlay-path>");
            }
            if let Err(err) = steps::run_init(Path::new(&args[2])) {
                error!(error = %err, "init failed");
                exit(1);
            }
        }
        Some("--copy") => {
            if args.len() < 4 {
                fatal_usage("--copy <src> <dst>");
            }
            if let Err(err) = steps::copy_executable(Path::new(&args[2]), Path::new(&args[3])) {
                error!(error = %err, "copy failed");
                exit(1);
            }
        }
        Some("--check-file") => {
            if args.len() < 3 {
                fatal_usage("--check-file <path>");
            }
            exit(if Path::new(&args[2]).exists() { 0 } else { 1 });
        }
        Some("--check-dir") => {
            if args.len() < 3 {
                fatal_usage("--check-dir <path>");
            }
            exit(if Path::new(&args[2]).is_dir() { 0 } else { 1 });
        }
        _ => {
            eprintln!("Usage: {} <verb> [args...]", args[0]);
            eprintln!();
            eprintln!("Verbs:");
            eprintln!("  --ready                       readiness probe for the mounted rootfs");
            eprintln!("  --entrypoint <wd> <cmd...>    run the command inside the chroot");
            eprintln!("  --init <overlay>              install helper and seed the /bin overlay");
            eprintln!("  --copy <src> <dst>            copy a file and mark it executable");
            eprintln!("  --check-file <path>           exit 0 when the path exists");
            eprintln!("  --check-dir <path>            exit 0 when the path is a directory");
            exit(2);
        }
    }
}

fn fatal_usage(usage: &str) -> ! {
    eprintln!("Usage: stoppable-exec {}", usage);
    exit(2);
}
