/// per-key registry of upstream fetches that are still running.
///
/// A key has at most one flight. The first miss starts it (the leader), later
/// misses on the same key clone its shared future and wait on the same result.
/// The fetch task removes its own entry when it completes.
///
use async_std::sync::Mutex;
use futures::future::{BoxFuture, FutureExt, Shared};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CacheError;

pub type FetchResult = Result<String, CacheError>;
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct Flight {
    id: u64,
    fetch: SharedFetch,
    waiters: usize,
}

/// how a caller got attached to a flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

#[derive(Clone, Default)]
pub struct InflightRegistry {
    flights: Arc<Mutex<HashMap<String, Flight>>>,
    next_id: Arc<AtomicU64>,
}

impl InflightRegistry {
    pub fn new() -> InflightRegistry {
        InflightRegistry::default()
    }

    /// join the running flight for `key`, or call `start` with a fresh flight id
    /// and register what it returns. `start` runs with the registry locked, so the
    /// flight cannot complete before it is registered.
    pub async fn join_or_start<F>(&self, key: &str, start: F) -> (SharedFetch, Role)
    where
        F: FnOnce(u64) -> BoxFuture<'static, FetchResult>,
    {
        let mut flights = self.flights.lock().await;
        if let Some(flight) = flights.get_mut(key) {
            flight.waiters += 1;
            return (flight.fetch.clone(), Role::Follower);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fetch = start(id).shared();
        flights.insert(
            key.to_string(),
            Flight {
                id,
                fetch: fetch.clone(),
                waiters: 1,
            },
        );

        (fetch, Role::Leader)
    }

    /// drop the flight for `key` if it is still flight `id`; returns how many
    /// callers waited on it
    pub async fn complete(&self, key: &str, id: u64) -> usize {
        let mut flights = self.flights.lock().await;
        if flights.get(key).map(|f| f.id) != Some(id) {
            return 0;
        }

        flights.remove(key).map_or(0, |f| f.waiters)
    }

    /// number of keys with a fetch in flight
    pub async fn len(&self) -> usize {
        self.flights.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future;

    #[test]
    fn leader_then_followers() {
        async_std::task::block_on(async move {
            let registry = InflightRegistry::new();

            let (first, role) = registry
                .join_or_start("k", |_| future::ready(Ok("v".to_string())).boxed())
                .await;
            assert_eq!(role, Role::Leader);

            let (second, role) = registry
                .join_or_start("k", |_| panic!("a second flight must not start"))
                .await;
            assert_eq!(role, Role::Follower);
            assert_eq!(registry.len().await, 1);

            assert_eq!(first.await, Ok("v".to_string()));
            assert_eq!(second.await, Ok("v".to_string()));

            assert_eq!(registry.complete("k", 0).await, 2);
            assert!(registry.is_empty().await);
        });
    }

    #[test]
    fn stale_id_does_not_remove() {
        async_std::task::block_on(async move {
            let registry = InflightRegistry::new();
            let (_, _) = registry
                .join_or_start("k", |_| future::pending::<FetchResult>().boxed())
                .await;

            assert_eq!(registry.complete("k", 99).await, 0);
            assert_eq!(registry.len().await, 1);
            assert_eq!(registry.complete("other", 0).await, 0);
        });
    }
}
