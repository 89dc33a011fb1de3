//! Contract module interfaces
//!
//! Modules are produced by the bytecode transformation pipeline, which
//! lives outside this crate. The engine never inspects module code; it
//! asks a [`ModuleLoader`] to instantiate it and then only invokes it.
//!
//! A [`Module`] holds no per-transaction state. A contract's heap lives
//! in the task's reentrant call stack and is reached through the
//! [`Runtime`] handed to every invocation, which is what lets the same
//! module be re-entered while one of its invocations is still running.

use crate::runtime::Runtime;
use crate::trap::Trap;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Module loading errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// Module failed pre-execution checks
    #[error("Module rejected: {0}")]
    Rejected(String),

    /// No code was supplied
    #[error("Empty module code")]
    Empty,
}

/// Result type for module operations
pub type Result<T> = std::result::Result<T, ModuleError>;

/// A loaded, sandboxed contract program
pub trait Module: Send + Sync {
    /// Invoke the module entry point
    ///
    /// # Arguments
    /// * `rt` - Host interface of the current call frame
    /// * `args` - Encoded entry arguments
    ///
    /// # Returns
    /// Return data, or the [`Trap`] that stopped the frame
    fn invoke(&self, rt: &mut dyn Runtime, args: &[u8]) -> std::result::Result<Vec<u8>, Trap>;

    /// Run the module initializer at deployment
    fn deploy(&self, rt: &mut dyn Runtime, args: &[u8]) -> std::result::Result<(), Trap> {
        let _ = (rt, args);
        Ok(())
    }

    /// Number of classes (types) the module defines, for deployment billing
    fn class_count(&self) -> usize {
        1
    }
}

/// Produces modules from code
pub trait ModuleLoader: Send + Sync {
    /// Instantiate module code
    fn instantiate(&self, code: &[u8]) -> Result<Arc<dyn Module>>;
}

/// Cache of instantiated modules keyed by code hash
///
/// Modules are immutable, so one instance is shared by every task and
/// every worker. Eviction is least-recently-used.
pub struct ModuleCache {
    loader: Arc<dyn ModuleLoader>,
    modules: Mutex<LruCache<[u8; 32], Arc<dyn Module>>>,
}

impl ModuleCache {
    /// Create a cache in front of `loader`
    ///
    /// # Arguments
    /// * `loader` - Loader used on cache misses
    /// * `capacity` - Maximum number of cached modules
    pub fn new(loader: Arc<dyn ModuleLoader>, capacity: NonZeroUsize) -> Self {
        Self {
            loader,
            modules: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get the module for `code`, instantiating it on a miss
    pub fn get_or_instantiate(&self, code: &[u8]) -> Result<Arc<dyn Module>> {
        if code.is_empty() {
            return Err(ModuleError::Empty);
        }

        let key = *blake3::hash(code).as_bytes();
        if let Some(module) = self.modules.lock().get(&key) {
            return Ok(Arc::clone(module));
        }

        // Instantiate outside the lock; a racing miss produces an
        // equivalent module and the last insert wins.
        let module = self.loader.instantiate(code)?;
        debug!("Instantiated module {}", hex::encode(&key[..8]));
        self.modules.lock().put(key, Arc::clone(&module));
        Ok(module)
    }

    /// Number of cached modules
    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.modules.lock().is_empty()
    }
}

impl fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    impl Module for Echo {
        fn invoke(&self, _rt: &mut dyn Runtime, args: &[u8]) -> std::result::Result<Vec<u8>, Trap> {
            Ok(args.to_vec())
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl ModuleLoader for CountingLoader {
        fn instantiate(&self, code: &[u8]) -> Result<Arc<dyn Module>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if code == b"bad" {
                return Err(ModuleError::Rejected("bad".to_string()));
            }
            Ok(Arc::new(Echo))
        }
    }

    fn cache(capacity: usize) -> (Arc<CountingLoader>, ModuleCache) {
        let loader = Arc::new(CountingLoader::default());
        let cache = ModuleCache::new(loader.clone(), NonZeroUsize::new(capacity).unwrap());
        (loader, cache)
    }

    #[test]
    fn test_cache_hit_skips_loader() {
        let (loader, cache) = cache(4);

        cache.get_or_instantiate(b"echo").unwrap();
        cache.get_or_instantiate(b"echo").unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rejected_module_is_not_cached() {
        let (loader, cache) = cache(4);

        assert_eq!(
            cache.get_or_instantiate(b"bad").err(),
            Some(ModuleError::Rejected("bad".to_string()))
        );
        assert!(cache.get_or_instantiate(b"bad").is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_code() {
        let (_, cache) = cache(4);

        assert_eq!(cache.get_or_instantiate(b"").err(), Some(ModuleError::Empty));
    }

    #[test]
    fn test_eviction() {
        let (loader, cache) = cache(1);

        cache.get_or_instantiate(b"a").unwrap();
        cache.get_or_instantiate(b"b").unwrap();
        cache.get_or_instantiate(b"a").unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 3);
    }
}
