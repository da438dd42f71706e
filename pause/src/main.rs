//! Minimal pause binary used as the rootfs container's entrypoint.
//!
//! Injected through a shared volume, so it works with any image including
//! scratch and distroless ones that ship no shell. Blocks until SIGTERM or
//! SIGINT. Build statically (musl) for release images.

use nix::sys::signal::{SigSet, Signal};

fn main() {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGINT);

    if signals.thread_block().is_err() {
        std::process::exit(1);
    }
    let _ = signals.wait();
}
