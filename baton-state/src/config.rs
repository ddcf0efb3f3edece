//! Coordination layer configuration
//!
//! Settings are read from the environment with defaults suitable for a
//! single orchestrator process.

/// Configuration for caches and read paths
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Largest accepted history page size
    pub max_page_size: usize,

    /// Maximum entries per cache; a full cache serves loads without storing them
    pub cache_capacity: usize,

    /// Preload the pipeline cache with the instances found by the cold-start scan
    pub warm_history_on_start: bool,
}

impl StateConfig {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - BATON_MAX_PAGE_SIZE (default: 100)
    /// - BATON_CACHE_CAPACITY (default: 10000)
    /// - BATON_WARM_HISTORY (true/false, default: true)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let max_page_size = match std::env::var("BATON_MAX_PAGE_SIZE") {
            Ok(raw) => raw
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("BATON_MAX_PAGE_SIZE is not a number: {}", e))?,
            Err(_) => defaults.max_page_size,
        };

        let cache_capacity = match std::env::var("BATON_CACHE_CAPACITY") {
            Ok(raw) => raw
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("BATON_CACHE_CAPACITY is not a number: {}", e))?,
            Err(_) => defaults.cache_capacity,
        };

        let warm_history_on_start = std::env::var("BATON_WARM_HISTORY")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(defaults.warm_history_on_start);

        let config = Self {
            max_page_size,
            cache_capacity,
            warm_history_on_start,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_page_size == 0 {
            anyhow::bail!("max_page_size must be greater than 0");
        }

        if self.cache_capacity == 0 {
            anyhow::bail!("cache_capacity must be greater than 0");
        }

        Ok(())
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_page_size: 100,
            cache_capacity: 10_000,
            warm_history_on_start: true,
        }
    }
}
