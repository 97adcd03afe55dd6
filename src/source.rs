/// the slow upstream data source that sits behind the cache.
///
use async_trait::async_trait;
use log::*;
use std::time::Duration;

use crate::error::SourceError;

pub const DEFAULT_PAYLOAD: &str = "Données récupérées de la base de données";
pub const DEFAULT_DELAY: Duration = Duration::from_millis(2000);

/// an upstream fetch; implementations must be idempotent and free of side effects
#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<String, SourceError>;
}

/// stands in for a database query: returns a fixed payload after a delay
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    payload: String,
    delay: Duration,
}

impl SimulatedSource {
    pub fn new(payload: &str, delay: Duration) -> SimulatedSource {
        SimulatedSource {
            payload: payload.to_string(),
            delay,
        }
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        SimulatedSource::new(DEFAULT_PAYLOAD, DEFAULT_DELAY)
    }
}

#[async_trait]
impl Source for SimulatedSource {
    async fn fetch(&self, key: &str) -> Result<String, SourceError> {
        debug!("simulated fetch for key: {}, delay: {:?}", key, self.delay);
        async_std::task::sleep(self.delay).await;
        Ok(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_payload() {
        async_std::task::block_on(async move {
            let source = SimulatedSource::new(DEFAULT_PAYLOAD, Duration::from_millis(5));
            let value = source.fetch("my_data_cache").await.unwrap();
            assert_eq!(value, "Données récupérées de la base de données");
        });
    }
}
