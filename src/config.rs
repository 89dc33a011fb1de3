//! Engine configuration and execution environment

use crate::billing::BillingSchedule;
use crate::module::{ModuleCache, ModuleLoader};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default maximum number of frames on a call chain
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10;

/// Default cap on a captured object graph (1 MiB)
pub const DEFAULT_MAX_GRAPH_BYTES: u64 = 1024 * 1024;

/// Default number of cached modules
pub const DEFAULT_MODULE_CACHE_CAPACITY: usize = 256;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads
    pub worker_threads: usize,

    /// Energy price schedule
    pub billing: BillingSchedule,

    /// Maximum number of frames on a call chain, the external one included
    pub max_call_depth: usize,

    /// Largest object graph snapshot a contract may capture
    pub max_graph_bytes: u64,

    /// Number of instantiated modules kept in the cache
    pub module_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            billing: BillingSchedule::default(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_graph_bytes: DEFAULT_MAX_GRAPH_BYTES,
            module_cache_capacity: DEFAULT_MODULE_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Set the number of worker threads
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Set the billing schedule
    pub fn with_billing(mut self, billing: BillingSchedule) -> Self {
        self.billing = billing;
        self
    }
}

/// Immutable execution environment
///
/// Built once from the configuration and a module loader, then shared by
/// every worker and passed by reference into every task.
#[derive(Debug)]
pub struct Environment {
    config: EngineConfig,
    modules: ModuleCache,
}

impl Environment {
    /// Create an environment
    pub fn new(config: EngineConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        let capacity =
            NonZeroUsize::new(config.module_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            modules: ModuleCache::new(loader, capacity),
            config,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Energy price schedule
    pub fn billing(&self) -> &BillingSchedule {
        &self.config.billing
    }

    /// Module cache
    pub fn modules(&self) -> &ModuleCache {
        &self.modules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert!(config.worker_threads >= 1);
        assert_eq!(config.max_call_depth, 10);
        assert_eq!(config.max_graph_bytes, 1024 * 1024);
        assert_eq!(config.billing, BillingSchedule::default());
    }

    #[test]
    fn test_config_survives_bincode() {
        let config: EngineConfig = bincode::deserialize(
            &bincode::serialize(&EngineConfig::default().with_worker_threads(3)).unwrap(),
        )
        .unwrap();

        assert_eq!(config.worker_threads, 3);
    }
}
