use anyhow::Result;
use async_channel::{bounded, Receiver, Sender};
use async_trait::async_trait;
use domain_keys::keys::RouteKey;
use futures::future::{self, Either};
use hashbrown::HashMap;
use log::*;
use serde::{Deserialize, Serialize};
use service_uptime::Uptime;
use std::time::{Duration, Instant};

use super::CacheStore;
use crate::error::StoreError;
use crate::worker::{JsonString, OK};

/// how often the handler drops expired entries it has not been asked about
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum Command {
    SetEx(String, String, Duration, Sender<Option<String>>),
    Get(String, Sender<Option<String>>),
    Remove(String, Sender<Option<String>>),
    Keys(Sender<Vec<String>>),
    Len(Sender<usize>),
    Sweep,
    Status(Sender<JsonString>), // request the store's status
    Shutdown,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    // None when the ttl reaches past what an Instant can hold
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, now: Instant, ttl: Duration) -> Entry {
        Entry {
            value,
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub store_id: String,
    pub status: String,
    pub uptime: String,
    pub entries: usize,
    /// entries held, including expired ones not yet swept
    pub stored: usize,
    pub error_count: u16,
}

// the next request, or a Sweep once the interval has passed; None when every handle is gone
async fn next_command(rx: &Receiver<Command>, last_sweep: Instant, every: Duration) -> Option<Command> {
    if last_sweep.elapsed() >= every {
        return Some(Command::Sweep);
    }

    let recv = rx.recv();
    let tick = async_std::task::sleep(every.saturating_sub(last_sweep.elapsed()));
    futures::pin_mut!(recv, tick);

    match future::select(recv, tick).await {
        Either::Left((cmd, _)) => cmd.ok(),
        Either::Right(_) => Some(Command::Sweep),
    }
}

// the handler loop
pub async fn handler(id: String, rx: Receiver<Command>, sweep_every: Duration) -> Result<()> {
    let uptime = Uptime::new();
    let mut error_count = 0;
    let mut last_sweep = Instant::now();

    let mut cache: HashMap<String, Entry> = HashMap::new();

    // now read and respond to requests
    while let Some(cmd) = next_command(&rx, last_sweep, sweep_every).await {
        debug!("recv cmd: {:?}", cmd);
        match cmd {
            Command::SetEx(key, value, ttl, tx) => {
                debug!("setex k: {}, ttl: {:?}", key, ttl);
                let now = Instant::now();
                let entry = Entry::new(value, now, ttl);

                let previous = cache
                    .insert(key, entry)
                    .filter(|e| e.is_live(now))
                    .map(|e| e.value);
                error_count += send_optional_response(previous, tx).await;
            }
            Command::Get(key, tx) => {
                debug!("get key: {}", key);
                let now = Instant::now();
                let value = match cache.get(&key) {
                    Some(e) if e.is_live(now) => Some(e.value.clone()),
                    Some(_) => {
                        debug!("key expired: {}", key);
                        cache.remove(&key);
                        None
                    }
                    None => None,
                };
                error_count += send_optional_response(value, tx).await;
            }
            Command::Remove(key, tx) => {
                debug!("remove key: {}", key);
                let now = Instant::now();
                let value = cache
                    .remove(&key)
                    .filter(|e| e.is_live(now))
                    .map(|e| e.value);
                error_count += send_optional_response(value, tx).await;
            }
            Command::Keys(tx) => {
                let now = Instant::now();
                let list: Vec<String> = cache
                    .iter()
                    .filter(|(_, e)| e.is_live(now))
                    .map(|(k, _)| k.to_string())
                    .collect();
                if tx.send(list).await.is_err() {
                    error_count += 1;
                    error!("error returning keys");
                }
            }
            Command::Len(tx) => {
                let now = Instant::now();
                let sz = cache.values().filter(|e| e.is_live(now)).count();
                if tx.send(sz).await.is_err() {
                    error_count += 1;
                    error!("error returning len");
                }
            }
            Command::Sweep => {
                let now = Instant::now();
                last_sweep = now;
                let before = cache.len();
                cache.retain(|_, e| e.is_live(now));
                let dropped = before - cache.len();
                if dropped > 0 {
                    debug!("store id: {}, swept {} expired entries", id, dropped);
                }
            }
            Command::Status(tx) => {
                let now = Instant::now();
                let status = StoreStatus {
                    store_id: id.to_string(),
                    status: OK.to_string(),
                    uptime: uptime.to_string(),
                    entries: cache.values().filter(|e| e.is_live(now)).count(),
                    stored: cache.len(),
                    error_count,
                };

                let msg = match serde_json::to_string(&status) {
                    Ok(js) => js,
                    Err(e) => {
                        format!(r#"{}"status":"json parse error: {:?}"{}"#, "{", e, "}\n")
                    }
                };

                info!("status response: {}", msg);
                if tx.send(msg).await.is_err() {
                    error_count += 1;
                    error!("error returning status to channel: {:?}", tx);
                }
            }
            Command::Shutdown => {
                info!("store id: {}, shutdown", id);
                break;
            }
        }
    }

    // helper functions
    async fn send_optional_response(msg: Option<String>, tx: Sender<Option<String>>) -> u16 {
        if let Err(e) = tx.send(msg).await {
            error!("error sending message: {:?}", e);
            1u16
        } else {
            0u16
        }
    }

    rx.close();

    Ok(())
}

/// an in-process key/value store with per-entry expiry, served by a background worker task
#[derive(Debug, Clone)]
pub struct MemoryStore {
    id: String,
    uptime: Uptime,
    request_tx: Sender<Command>,
}

impl MemoryStore {
    /// create and start a new store worker.
    pub fn new() -> MemoryStore {
        MemoryStore::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(every: Duration) -> MemoryStore {
        let uptime = Uptime::new();
        let id = RouteKey::create();

        // this is for the store struct
        let sid = id.clone();

        info!("starting up memory store, id: {}", id);

        let (request_tx, request_receiver) = bounded(250);

        // run the handler loop as a background task
        async_std::task::spawn(async move {
            match handler(id.clone(), request_receiver, every).await {
                Ok(()) => info!("store handler exit for store id: {}", id),
                Err(e) => error!("store exit with error: {:?}", e),
            }
        });

        MemoryStore {
            id: sid,
            uptime,
            request_tx,
        }
    }

    /// return the store's id
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    /// return how long this store has been alive
    pub fn get_uptime(&self) -> String {
        self.uptime.to_string()
    }

    /// This is invoked by the client to enable sending command request to
    /// the store worker
    pub fn request_channel(&self) -> Sender<Command> {
        self.request_tx.clone()
    }

    pub async fn remove(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx
            .send(Command::Remove(key.to_string(), tx))
            .await?;
        Ok(rx.recv().await?)
    }

    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx.send(Command::Keys(tx)).await?;
        Ok(rx.recv().await?)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx.send(Command::Len(tx)).await?;
        Ok(rx.recv().await?)
    }

    pub async fn status(&self) -> Result<JsonString, StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx.send(Command::Status(tx)).await?;
        Ok(rx.recv().await?)
    }

    /// stop the worker; every later call fails with `StoreError::Unavailable`
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.request_tx.send(Command::Shutdown).await?;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx.send(Command::Get(key.to_string(), tx)).await?;
        Ok(rx.recv().await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let (tx, rx) = bounded(1);
        let cmd = Command::SetEx(key.to_string(), value.to_string(), ttl, tx);
        self.request_tx.send(cmd).await?;
        rx.recv().await?;
        Ok(())
    }
}
