/// wires a worker together: store, source, read-through coordinator and both http apps
///
use anyhow::Result;
use log::*;
use std::io::Write;
use std::sync::Arc;

use crate::cache::ReadThrough;
use crate::config::{ServiceArgs, StoreKind};
use crate::http::{data_app, probe_app, shared_listener};
use crate::source::{SimulatedSource, DEFAULT_PAYLOAD};
use crate::store::{CacheStore, MemoryStore, RedisStore};
use crate::worker::READY_PREFIX;

/// build the store handle this worker injects into its request handlers
pub fn open_store(args: &ServiceArgs) -> Result<Arc<dyn CacheStore>> {
    let store: Arc<dyn CacheStore> = match args.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Redis => Arc::new(RedisStore::open(&args.redis_url)?),
    };

    Ok(store)
}

pub fn read_through(args: &ServiceArgs) -> Result<ReadThrough> {
    let store = open_store(args)?;
    let source = SimulatedSource::new(DEFAULT_PAYLOAD, args.source_delay());

    Ok(ReadThrough::new(store, Arc::new(source), args.read_through()))
}

/// bind both services and serve until a listener fails.
///
/// With `announce` set the worker writes `listening <pid>` to stdout once both
/// ports are bound, which is how the supervisor learns it is ready.
pub async fn run_worker(args: &ServiceArgs, announce: bool) -> Result<()> {
    let pid = std::process::id();
    let cache = read_through(args)?;

    let data = shared_listener(args.data_addr())?;
    let probe = shared_listener(args.probe_addr())?;
    info!(
        "worker pid: {} listening on {} (data) and {} (probe), store: {}",
        pid,
        args.data_addr(),
        args.probe_addr(),
        args.store.as_str()
    );

    if announce {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{} {}", READY_PREFIX, pid)?;
        stdout.flush()?;
    }

    let data_app = data_app(cache, &args.default_key);
    let probe_app = probe_app(pid);

    futures::try_join!(data_app.listen(data), probe_app.listen(probe))?;

    Ok(())
}
