use async_std::future::timeout;
use async_std::sync::Mutex;
use async_trait::async_trait;
use log::*;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use super::CacheStore;
use crate::error::StoreError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// whole seconds for SETEX; sub-second ttls round up so they are never zero
pub fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    let secs = if ttl.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs };
    secs.max(1)
}

/// a redis backed store shared by every worker process.
///
/// The connection is opened lazily and dropped after any failed command, so a
/// worker can start while redis is down and pick it up once it is reachable.
pub struct RedisStore {
    client: redis::Client,
    connect_timeout: Duration,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<RedisStore, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(RedisStore {
            client,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            conn: Mutex::new(None),
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> RedisStore {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Unavailable("redis connect timed out".to_string()))??;

        info!("connected to redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            warn!("dropping redis connection after error");
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.reset().await;
                Err(e.into())
            }
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        match conn.set_ex::<_, _, ()>(key, value, ttl_seconds(ttl)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset().await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up() {
        assert_eq!(ttl_seconds(Duration::from_secs(3600)), 3600);
        assert_eq!(ttl_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ttl_seconds(Duration::ZERO), 1);
        assert_eq!(ttl_seconds(Duration::MAX), u64::MAX);
    }

    #[test]
    fn bad_url() {
        assert!(RedisStore::open("not a url").is_err());
    }

    #[test]
    fn unreachable_server() {
        async_std::task::block_on(async move {
            // nothing listens on port 1
            let store = RedisStore::open("redis://127.0.0.1:1/")
                .unwrap()
                .with_connect_timeout(Duration::from_millis(500));

            let err = store.get("k").await.unwrap_err();
            assert!(matches!(err, StoreError::Unavailable(_)));
        });
    }
}
