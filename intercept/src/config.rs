//! Process-wide tuning knobs, read once from the environment.

use std::sync::OnceLock;
use std::time::Duration;

use log::warn;

pub const SLAB_SIZE_VAR: &str = "RELAY_SLAB_SIZE";
pub const NEAR_ALLOC_VAR: &str = "RELAY_NEAR_ALLOC";
pub const QUIESCE_TIMEOUT_VAR: &str = "RELAY_QUIESCE_TIMEOUT_MS";
pub const HOOK_DEBUG_VAR: &str = "RELAY_HOOK_DEBUG";

const DEFAULT_SLAB_SIZE: usize = 4096;
const DEFAULT_QUIESCE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptConfig {
    /// Bytes mapped per trampoline region. Rounded up to the page size by the allocator.
    pub slab_size: usize,
    /// Place trampolines within rel32 reach of the code they relay for.
    pub near_alloc: bool,
    /// How long `Detour::remove` waits for in-flight calls before retiring the stub.
    pub quiesce_timeout: Duration,
    /// Hex-dump every generated stub at debug level.
    pub hook_debug: bool,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            slab_size: DEFAULT_SLAB_SIZE,
            near_alloc: true,
            quiesce_timeout: DEFAULT_QUIESCE_TIMEOUT,
            hook_debug: false,
        }
    }
}

impl InterceptConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Malformed values fall back
    /// to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(raw) = lookup(SLAB_SIZE_VAR) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => cfg.slab_size = n,
                _ => warn!("ignoring {SLAB_SIZE_VAR}={raw:?}: expected a positive byte count"),
            }
        }

        if let Some(raw) = lookup(NEAR_ALLOC_VAR) {
            cfg.near_alloc = !matches!(raw.trim(), "0" | "false" | "off" | "no");
        }

        if let Some(raw) = lookup(QUIESCE_TIMEOUT_VAR) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => cfg.quiesce_timeout = Duration::from_millis(ms),
                Err(_) => warn!("ignoring {QUIESCE_TIMEOUT_VAR}={raw:?}: expected milliseconds"),
            }
        }

        cfg.hook_debug = lookup(HOOK_DEBUG_VAR).is_some();
        cfg
    }
}

static CONFIG: OnceLock<InterceptConfig> = OnceLock::new();

/// The active configuration. Loaded from the environment on first use.
pub fn config() -> &'static InterceptConfig {
    CONFIG.get_or_init(InterceptConfig::from_env)
}
