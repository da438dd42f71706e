/// Operator configuration, constructed once in `main` and passed down into
/// the reconcilers and the pod builder. Nothing reads the environment after
/// startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Trusted image carrying the driver, pause, and exec-wrapper binaries.
    pub wrapper_image: String,
    /// Pull policy for that image.
    pub wrapper_pull_policy: String,
}

pub const WRAPPER_IMAGE_ENV: &str = "STOPPABLE_WRAPPER_IMAGE";
pub const WRAPPER_PULL_POLICY_ENV: &str = "STOPPABLE_WRAPPER_PULL_POLICY";

const DEFAULT_WRAPPER_IMAGE: &str = "ghcr.io/stoppable-dev/stoppable-exec:latest";
const DEFAULT_WRAPPER_PULL_POLICY: &str = "IfNotPresent";

impl Config {
    pub fn from_env() -> Self {
        Config {
            wrapper_image: env_or(WRAPPER_IMAGE_ENV, DEFAULT_WRAPPER_IMAGE),
            wrapper_pull_policy: env_or(WRAPPER_PULL_POLICY_ENV, DEFAULT_WRAPPER_PULL_POLICY),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            wrapper_image: DEFAULT_WRAPPER_IMAGE.to_string(),
            wrapper_pull_policy: DEFAULT_WRAPPER_PULL_POLICY.to_string(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}
