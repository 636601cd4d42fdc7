use std::time::Duration;

pub const SCRIPT_PLACEHOLDER: &str = "{script}";
pub const SCRIPT_FILE_STEM: &str = "script";
pub const WORKSPACE_PREFIX: &str = "script-runner-";

pub const FALLBACK_LAUNCHER: &str = "/usr/bin/env";

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Tool caches searched before `PATH`, relative to the home directory.
pub const HOME_TOOL_CACHES: &[&str] = &[".gradle/caches"];
