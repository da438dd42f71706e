//! Overlay recipe extraction and rehosting.
//!
//! The container runtime mounts every container's rootfs as an overlay at
//! `/`. Reading the rootfs container's `/proc/<pid>/mounts` yields the exact
//! `lowerdir=…,upperdir=…,workdir=…` recipe the runtime used; rewriting the
//! runtime's paths to go through the agent's host-root bind mount lets the
//! agent reproduce the same mount at a stable host path.

/// Extracts the option string of the overlay mounted at `/` from the
/// contents of a `/proc/<pid>/mounts` file.
pub fn overlay_options(mounts: &str) -> Result<String, OverlayError> {
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 && fields[0] == "overlay" && fields[1] == "/" && fields[2] == "overlay"
        {
            let opts = fields[3];
            for key in ["lowerdir=", "upperdir=", "workdir="] {
                if !opts.contains(key) {
                    return Err(OverlayError::MissingKey(key));
                }
            }
            return Ok(opts.to_string());
        }
    }
    Err(OverlayError::NotFound)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OverlayError {
    #[error("overlayfs mount not found")]
    NotFound,
    #[error("invalid overlay options: missing {0}")]
    MissingKey(&'static str),
}

/// Rewrites the directory options so every runtime path is reachable through
/// the host-root bind mount.
///
/// Only the path-valued keys are touched, and within them only paths that
/// begin with `runtime_prefix` at a component boundary. Paths already under
/// `host_root` are left alone, which makes reapplication a no-op.
pub fn rehost(options: &str, runtime_prefix: &str, host_root: &str) -> String {
    options
        .split(',')
        .map(|opt| match opt.split_once('=') {
            Some((key, value)) if is_path_key(key) => {
                let rewritten: Vec<String> = value
                    .split(':')
                    .map(|path| rehost_path(path, runtime_prefix, host_root))
                    .collect();
                format!("{}={}", key, rewritten.join(":"))
            }
            _ => opt.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn is_path_key(key: &str) -> bool {
    matches!(key, "lowerdir" | "upperdir" | "workdir")
}

fn rehost_path(path: &str, runtime_prefix: &str, host_root: &str) -> String {
    if has_dir_prefix(path, host_root) {
        return path.to_string();
    }
    if has_dir_prefix(path, runtime_prefix) {
        return format!("{}{}", host_root, path);
    }
    path.to_string()
}

fn has_dir_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
overlay / overlay rw,relatime,lowerdir=/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs/snapshots/12/fs:/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs/snapshots/11/fs,upperdir=/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs/snapshots/42/fs,workdir=/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs/snapshots/42/work 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
tmpfs /dev tmpfs rw,nosuid,size=65536k,mode=755 0 0
";

    #[test]
    fn extracts_root_overlay_options() {
        let opts = overlay_options(MOUNTS).unwrap();
        assert!(opts.starts_with("rw,relatime,lowerdir="));
        assert!(opts.contains("workdir="));
    }

    #[test]
    fn missing_overlay_line_is_an_error() {
        let err = overlay_options("proc /proc proc rw 0 0\n").unwrap_err();
        assert_eq!(err, OverlayError::NotFound);
    }

    #[test]
    fn overlay_not_mounted_at_root_is_ignored() {
        let err =
            overlay_options("overlay /data overlay rw,lowerdir=/a,upperdir=/b,workdir=/c 0 0\n")
                .unwrap_err();
        assert_eq!(err, OverlayError::NotFound);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let err = overlay_options("overlay / overlay rw,lowerdir=/a,workdir=/c 0 0\n").unwrap_err();
        assert_eq!(err, OverlayError::MissingKey("upperdir="));
    }

    #[test]
    fn rehost_prefixes_runtime_paths() {
        let opts = "rw,lowerdir=/var/lib/containerd/s/1/fs:/var/lib/containerd/s/2/fs,upperdir=/var/lib/containerd/s/3/fs,workdir=/var/lib/containerd/s/3/work";
        let out = rehost(opts, "/var/lib/containerd", "/host");
        assert_eq!(
            out,
            "rw,lowerdir=/host/var/lib/containerd/s/1/fs:/host/var/lib/containerd/s/2/fs,upperdir=/host/var/lib/containerd/s/3/fs,workdir=/host/var/lib/containerd/s/3/work"
        );
    }

    #[test]
    fn rehost_is_idempotent() {
        let opts = "rw,lowerdir=/var/lib/containerd/s/1/fs,upperdir=/var/lib/containerd/s/3/fs,workdir=/var/lib/containerd/s/3/work";
        let once = rehost(opts, "/var/lib/containerd", "/host");
        let twice = rehost(&once, "/var/lib/containerd", "/host");
        assert_eq!(once, twice);
    }

    #[test]
    fn rehost_leaves_foreign_paths_alone() {
        let opts = "rw,lowerdir=/var/lib/docker/overlay2/x:/var/lib/containerd/s/1/fs,upperdir=/mnt/scratch/up,workdir=/mnt/scratch/work";
        let out = rehost(opts, "/var/lib/containerd", "/host");
        assert_eq!(
            out,
            "rw,lowerdir=/var/lib/docker/overlay2/x:/host/var/lib/containerd/s/1/fs,upperdir=/mnt/scratch/up,workdir=/mnt/scratch/work"
        );
    }

    #[test]
    fn rehost_requires_component_boundary() {
        let opts = "lowerdir=/var/lib/containerd-extra/fs,upperdir=/var/lib/containerd/u,workdir=/var/lib/containerd/w";
        let out = rehost(opts, "/var/lib/containerd", "/host");
        assert_eq!(
            out,
            "lowerdir=/var/lib/containerd-extra/fs,upperdir=/host/var/lib/containerd/u,workdir=/host/var/lib/containerd/w"
        );
    }

    #[test]
    fn rehost_does_not_touch_non_path_options() {
        let opts = "rw,relatime,index=off,lowerdir=/var/lib/containerd/s/1/fs,upperdir=/var/lib/containerd/u,workdir=/var/lib/containerd/w";
        let out = rehost(opts, "/var/lib/containerd", "/host");
        assert!(out.starts_with("rw,relatime,index=off,"));
    }
}
