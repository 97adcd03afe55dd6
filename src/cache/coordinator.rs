use async_std::future::timeout;
use futures::future::{BoxFuture, FutureExt};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::inflight::{FetchResult, InflightRegistry, Role};
use crate::error::CacheError;
use crate::source::Source;
use crate::store::CacheStore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadThroughConfig {
    /// how long a fetched value stays in the store
    pub ttl: Duration,
    /// upper bound on one upstream fetch; None waits forever
    pub fetch_timeout: Option<Duration>,
}

impl Default for ReadThroughConfig {
    fn default() -> Self {
        ReadThroughConfig {
            ttl: DEFAULT_TTL,
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
    store_errors: AtomicU64,
    fetch_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub coalesced: u64,
    pub store_errors: u64,
    pub fetch_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// serves values from the cache store, falling back to the upstream source on a miss.
///
/// Concurrent misses on one key share a single upstream fetch. A successful fetch
/// is written back with the configured ttl; a failed one is never cached. When the
/// store itself is unreachable the request degrades to a direct (still coalesced)
/// upstream fetch instead of failing.
///
/// If a value expires while a fetch for it is running, readers miss and wait on
/// that fetch; stale values are never served.
#[derive(Clone)]
pub struct ReadThrough {
    store: Arc<dyn CacheStore>,
    source: Arc<dyn Source>,
    config: ReadThroughConfig,
    inflight: InflightRegistry,
    counters: Arc<Counters>,
}

impl ReadThrough {
    pub fn new(
        store: Arc<dyn CacheStore>,
        source: Arc<dyn Source>,
        config: ReadThroughConfig,
    ) -> ReadThrough {
        ReadThrough {
            store,
            source,
            config,
            inflight: InflightRegistry::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &ReadThroughConfig {
        &self.config
    }

    /// return the value for `key` from the store, or fetch, cache and return it
    pub async fn get(&self, key: &str) -> Result<String, CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }

        match self.store.get(key).await {
            Ok(Some(value)) => {
                bump(&self.counters.hits);
                debug!("cache hit, key: {}", key);
                return Ok(value);
            }
            Ok(None) => {
                bump(&self.counters.misses);
                debug!("cache miss, key: {}", key);
            }
            Err(e) => {
                bump(&self.counters.store_errors);
                warn!("{}; fetching key: {} from upstream", e, key);
            }
        }

        let (fetch, role) = self
            .inflight
            .join_or_start(key, |id| self.start_fetch(key, id))
            .await;

        if role == Role::Follower {
            bump(&self.counters.coalesced);
            debug!("joined in-flight fetch, key: {}", key);
        }

        fetch.await
    }

    /// number of keys with an upstream fetch running
    pub async fn in_flight(&self) -> usize {
        self.inflight.len().await
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
        }
    }

    // run the fetch as its own task so it finishes, writes back and leaves the
    // registry even when every waiter has gone away
    fn start_fetch(&self, key: &str, id: u64) -> BoxFuture<'static, FetchResult> {
        let key = key.to_string();
        let store = self.store.clone();
        let source = self.source.clone();
        let config = self.config;
        let inflight = self.inflight.clone();
        let counters = self.counters.clone();

        let handle = async_std::task::spawn(async move {
            // a flight that finished between the caller's read and this one
            // has already written the value back
            match store.get(&key).await {
                Ok(Some(value)) => {
                    let waiters = inflight.complete(&key, id).await;
                    debug!("value for key: {} landed before fetch, waiters: {}", key, waiters);
                    return Ok(value);
                }
                Ok(None) => (),
                Err(e) => debug!("re-read of key: {} failed: {}", key, e),
            }

            bump(&counters.fetches);
            info!("fetching key: {} from upstream", key);

            let result = fetch_upstream(source.as_ref(), &key, config.fetch_timeout).await;
            match &result {
                Ok(value) => {
                    if let Err(e) = store.set_ex(&key, value, config.ttl).await {
                        bump(&counters.store_errors);
                        warn!("could not cache key: {}, {}", key, e);
                    }
                }
                Err(e) => {
                    bump(&counters.fetch_failures);
                    error!("fetch failed for key: {}, {}", key, e);
                }
            }

            let waiters = inflight.complete(&key, id).await;
            debug!("fetch complete, key: {}, waiters: {}", key, waiters);

            result
        });

        handle.boxed()
    }
}

async fn fetch_upstream(
    source: &dyn Source,
    key: &str,
    fetch_timeout: Option<Duration>,
) -> FetchResult {
    match fetch_timeout {
        Some(limit) => match timeout(limit, source.fetch(key)).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::SourceTimeout(limit)),
        },
        None => source.fetch(key).await.map_err(CacheError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SimulatedSource;
    use crate::store::MemoryStore;

    fn coordinator(delay_ms: u64) -> (ReadThrough, MemoryStore) {
        let store = MemoryStore::new();
        let source = SimulatedSource::new("payload", Duration::from_millis(delay_ms));
        let rt = ReadThrough::new(
            Arc::new(store.clone()),
            Arc::new(source),
            ReadThroughConfig::default(),
        );
        (rt, store)
    }

    #[test]
    fn empty_key() {
        async_std::task::block_on(async move {
            let (rt, _) = coordinator(1);
            assert_eq!(rt.get("").await, Err(CacheError::InvalidKey));
            assert_eq!(rt.stats(), CacheStats::default());
        });
    }

    #[test]
    fn miss_then_hit() {
        async_std::task::block_on(async move {
            let (rt, store) = coordinator(5);

            assert_eq!(rt.get("k").await.unwrap(), "payload");
            assert_eq!(store.get("k").await.unwrap().as_deref(), Some("payload"));
            assert_eq!(rt.get("k").await.unwrap(), "payload");

            let stats = rt.stats();
            assert_eq!(stats.misses, 1);
            assert_eq!(stats.hits, 1);
            assert_eq!(stats.fetches, 1);
            assert_eq!(rt.in_flight().await, 0);
        });
    }

    #[test]
    fn no_timeout() {
        async_std::task::block_on(async move {
            let source = SimulatedSource::new("slow", Duration::from_millis(20));
            let config = ReadThroughConfig {
                ttl: DEFAULT_TTL,
                fetch_timeout: None,
            };
            let rt = ReadThrough::new(Arc::new(MemoryStore::new()), Arc::new(source), config);
            assert_eq!(rt.get("k").await.unwrap(), "slow");
        });
    }
}
