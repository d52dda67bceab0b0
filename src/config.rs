//! Deployer-facing knobs, read once from the environment when the
//! allocator initializes. Nothing in this crate re-reads the
//! environment after [`Config::load`] runs under the init mutex: the
//! resulting `Config` is folded into the read-only [`crate::root`]
//! state.
use std::path::PathBuf;

/// Default empty-slab cache budget: `64 KiB * 1024`, as specified.
const DEFAULT_EMPTY_CACHE_BUDGET: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Whether every other slab index is skipped to act as a guard.
    pub guard_slabs: bool,
    /// Whether freed small-object bytes are zeroed before reuse.
    pub zero_on_free: bool,
    /// Whether slots carry and check a tail canary.
    pub canaries: bool,
    /// Bytes of committed-but-empty slabs a class may hold onto
    /// before spilling to the free (decommitted) list.
    pub empty_cache_budget: usize,
    /// When set, large allocations are backed by a temporary file in
    /// this directory instead of an anonymous mapping.
    pub backing_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            guard_slabs: true,
            zero_on_free: true,
            canaries: true,
            empty_cache_budget: DEFAULT_EMPTY_CACHE_BUDGET,
            backing_dir: None,
        }
    }
}

impl Config {
    /// Builds configuration from the environment. Called exactly
    /// once, from under the init mutex.
    pub fn load() -> Config {
        let mut config = Config::default();

        if env_flag_set("SLAB_GUARD_DISABLE") {
            config.guard_slabs = false;
        }
        if env_flag_set("SLAB_ZERO_ON_FREE_DISABLE") {
            config.zero_on_free = false;
        }
        if env_flag_set("SLAB_CANARY_DISABLE") {
            config.canaries = false;
        }

        if let Ok(value) = std::env::var("SLAB_EMPTY_CACHE_BUDGET_KIB") {
            match value.parse::<usize>() {
                Ok(kib) => config.empty_cache_budget = kib.saturating_mul(1024),
                Err(_) => log::warn!(
                    "rampart: SLAB_EMPTY_CACHE_BUDGET_KIB={:?} is not a number, keeping default",
                    value
                ),
            }
        }

        if let Ok(value) = std::env::var("SLAB_BACKING_DIR") {
            config.backing_dir = if value == ":memory:" {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }

        log::info!("rampart: configuration loaded: {:?}", config);
        config
    }
}

fn env_flag_set(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let config = Config::default();
        assert!(config.guard_slabs);
        assert!(config.zero_on_free);
        assert!(config.canaries);
        assert_eq!(config.empty_cache_budget, DEFAULT_EMPTY_CACHE_BUDGET);
        assert!(config.backing_dir.is_none());
    }
}
