use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_DRAIN_TIMEOUT, DEFAULT_GRACE_PERIOD, FALLBACK_LAUNCHER,
    HOME_TOOL_CACHES,
};

/// Tunables for session orchestration and process supervision.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Time between SIGTERM and SIGKILL when a run is cancelled.
    pub grace_period: Duration,
    /// Upper bound on waiting for output readers once the process is gone
    /// after a cancel. Readers still running after that are aborted.
    pub drain_timeout: Duration,
    pub channel_capacity: usize,
    /// Parent of the per-run temp directories. `None` means the system temp dir.
    pub workspace_root: Option<PathBuf>,
    /// Program used to retry a launch through the search path when the
    /// resolved toolchain binary cannot be executed directly.
    pub fallback_launcher: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            workspace_root: None,
            fallback_launcher: PathBuf::from(FALLBACK_LAUNCHER),
        }
    }
}

/// Where the native resolver looks for toolchains, in priority order.
#[derive(Clone, Debug, Default)]
pub struct ResolverConfig {
    pub cache_roots: Vec<PathBuf>,
    pub search_path: Vec<PathBuf>,
}

impl ResolverConfig {
    /// Cache roots under the home directory plus every entry of `PATH`.
    pub fn from_env() -> Self {
        let cache_roots = dirs::home_dir()
            .map(|home| HOME_TOOL_CACHES.iter().map(|rel| home.join(rel)).collect())
            .unwrap_or_default();

        let search_path = std::env::var_os("PATH")
            .map(|path| std::env::split_paths(&path).collect())
            .unwrap_or_default();

        Self {
            cache_roots,
            search_path,
        }
    }
}
