//! Assembly of the standard namespace cache chain.
//!
//! Decorators are applied innermost first:
//!
//! ```text
//! Blocking? -> Synchronized -> Logging -> Serialized? -> Scheduled? -> Eviction -> Perpetual
//! ```
//!
//! Eviction defaults to LRU. Bracketed layers appear only when configured.

use crate::cache::{
    BlockingCache, Cache, FifoCache, LoggingCache, LruCache, PerpetualCache, ScheduledCache,
    SerializedCache, SoftCache, SynchronizedCache, WeakCache,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// Eviction policy of a namespace cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Eviction {
    #[default]
    Lru,
    Fifo,
    Soft,
    Weak,
}

impl fmt::Display for Eviction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru => write!(f, "LRU"),
            Self::Fifo => write!(f, "FIFO"),
            Self::Soft => write!(f, "SOFT"),
            Self::Weak => write!(f, "WEAK"),
        }
    }
}

impl FromStr for Eviction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(Self::Lru),
            "FIFO" => Ok(Self::Fifo),
            "SOFT" => Ok(Self::Soft),
            "WEAK" => Ok(Self::Weak),
            other => Err(format!(
                "Unknown eviction policy '{}'. Expected LRU, FIFO, SOFT or WEAK",
                other
            )),
        }
    }
}

/// Namespace cache settings, as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Eviction policy (default: LRU)
    pub eviction: Option<Eviction>,
    /// Entry bound for the eviction policy (default: 1024)
    pub size: Option<usize>,
    /// Clear the whole cache this often (default: never)
    pub clear_interval_ms: Option<u64>,
    /// Hand out copies instead of shared values (default: true)
    pub read_write: Option<bool>,
    /// Block concurrent loaders of the same key (default: false)
    pub blocking: Option<bool>,
    /// Bound on the blocking wait (default: unbounded)
    pub blocking_timeout_ms: Option<u64>,
}

impl CacheOptions {
    pub fn eviction_or_default(&self) -> Eviction {
        self.eviction.unwrap_or_default()
    }

    pub fn size_or_default(&self) -> usize {
        self.size.unwrap_or(DEFAULT_CACHE_SIZE)
    }

    pub fn read_write_or_default(&self) -> bool {
        self.read_write.unwrap_or(true)
    }

    pub fn blocking_or_default(&self) -> bool {
        self.blocking.unwrap_or(false)
    }

    /// Validate cache options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.size == Some(0) {
            return Err("cache size must be greater than 0".to_string());
        }
        if self.clear_interval_ms == Some(0) {
            return Err("clear_interval_ms must be greater than 0".to_string());
        }
        if self.blocking_timeout_ms.is_some() && !self.blocking_or_default() {
            return Err("blocking_timeout_ms requires blocking=true".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CacheBuilder {
    id: String,
    eviction: Eviction,
    size: Option<usize>,
    clear_interval: Option<Duration>,
    read_write: bool,
    blocking: bool,
    blocking_timeout: Option<Duration>,
}

impl CacheBuilder {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            eviction: Eviction::Lru,
            size: None,
            clear_interval: None,
            read_write: true,
            blocking: false,
            blocking_timeout: None,
        }
    }

    #[must_use]
    pub fn from_options(id: impl Into<String>, options: &CacheOptions) -> Self {
        Self::new(id)
            .eviction(options.eviction_or_default())
            .size(options.size)
            .clear_interval(options.clear_interval_ms.map(Duration::from_millis))
            .read_write(options.read_write_or_default())
            .blocking(options.blocking_or_default())
            .blocking_timeout(options.blocking_timeout_ms.map(Duration::from_millis))
    }

    #[must_use]
    pub const fn eviction(mut self, eviction: Eviction) -> Self {
        self.eviction = eviction;
        self
    }

    #[must_use]
    pub const fn size(mut self, size: Option<usize>) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub const fn clear_interval(mut self, interval: Option<Duration>) -> Self {
        self.clear_interval = interval;
        self
    }

    #[must_use]
    pub const fn read_write(mut self, read_write: bool) -> Self {
        self.read_write = read_write;
        self
    }

    #[must_use]
    pub const fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    #[must_use]
    pub const fn blocking_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    pub fn build(self) -> Arc<dyn Cache> {
        debug!(
            cache_id = %self.id,
            eviction = %self.eviction,
            size = ?self.size,
            read_write = self.read_write,
            blocking = self.blocking,
            "Building cache"
        );
        let base: Box<dyn Cache> = Box::new(PerpetualCache::new(self.id));
        let size = self.size.unwrap_or(DEFAULT_CACHE_SIZE);
        let mut cache: Box<dyn Cache> = match self.eviction {
            Eviction::Lru => Box::new(LruCache::with_size(base, size)),
            Eviction::Fifo => Box::new(FifoCache::with_size(base, size)),
            Eviction::Soft => Box::new(SoftCache::with_limits(
                base,
                crate::cache::soft::DEFAULT_HARD_LINKS,
                size,
            )),
            Eviction::Weak => Box::new(WeakCache::with_threshold(base, size)),
        };
        if let Some(interval) = self.clear_interval {
            cache = Box::new(ScheduledCache::with_interval(cache, interval));
        }
        if self.read_write {
            cache = Box::new(SerializedCache::new(cache));
        }
        cache = Box::new(LoggingCache::new(cache));
        cache = Box::new(SynchronizedCache::new(cache));
        if self.blocking {
            cache = Box::new(BlockingCache::with_timeout(cache, self.blocking_timeout));
        }
        Arc::from(cache)
    }
}
