use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(test)]
use std::sync::Mutex;

use directories::BaseDirs;
use tracing::warn;

pub const APPLICATION_NAME: &str = "LiveBench";
pub const DEFAULT_ORGANIZATION: &str = "livebench.dev";
/// Port remote viewer hosts listen on unless `--addhost` names another.
pub const DEFAULT_HOST_PORT: u16 = 10234;

const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// LiveBench process configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Organization half of the coordination identity
    pub organization: String,
    pub application: String,
    /// Where the session lock and the argument socket live
    pub runtime_dir: PathBuf,
    pub forward_timeout: Duration,
    pub connect_timeout: Duration,
    pub default_host_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let organization = env::var("LIVEBENCH_ORGANIZATION")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.organization);
        let runtime_dir = env::var_os("LIVEBENCH_RUNTIME_DIR")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.runtime_dir);
        let forward_timeout =
            millis_from_env("LIVEBENCH_FORWARD_TIMEOUT_MS").unwrap_or(defaults.forward_timeout);
        let connect_timeout =
            millis_from_env("LIVEBENCH_CONNECT_TIMEOUT_MS").unwrap_or(defaults.connect_timeout);
        let default_host_port =
            parsed_from_env("LIVEBENCH_DEFAULT_PORT").unwrap_or(defaults.default_host_port);

        Self {
            organization,
            application: defaults.application,
            runtime_dir,
            forward_timeout,
            connect_timeout,
            default_host_port,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            organization: DEFAULT_ORGANIZATION.to_string(),
            application: APPLICATION_NAME.to_string(),
            runtime_dir: default_runtime_dir(),
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_host_port: DEFAULT_HOST_PORT,
        }
    }
}

fn default_runtime_dir() -> PathBuf {
    BaseDirs::new()
        .and_then(|dirs| dirs.runtime_dir().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(env::temp_dir)
}

/// Unset is silent; a value that does not parse is reported and ignored.
fn parsed_from_env<T: std::str::FromStr>(var: &str) -> Option<T> {
    let value = env::var(var).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(target = "livebench::config", var, %value, "ignoring malformed value");
            None
        }
    }
}

fn millis_from_env(var: &str) -> Option<Duration> {
    match parsed_from_env::<u64>(var)? {
        0 => {
            warn!(target = "livebench::config", var, "timeout must be positive; using default");
            None
        }
        millis => Some(Duration::from_millis(millis)),
    }
}
