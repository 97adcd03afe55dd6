/// command line and environment configuration
///
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::ReadThroughConfig;
use crate::cluster::{core_count, SupervisorConfig};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_DATA_PORT: u16 = 3000;
pub const DEFAULT_PROBE_PORT: u16 = 8000;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";
pub const DEFAULT_KEY: &str = "my_data_cache";
pub const DEFAULT_TTL_SECS: u64 = 3600;
/// ten years
pub const MAX_TTL_SECS: u64 = 315_360_000;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SOURCE_DELAY_MS: u64 = 2000;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 500;

#[derive(Debug, Parser)]
#[command(name = "cache-cluster", version, about = "read-through cache served by a supervised worker pool")]
pub struct Cli {
    #[command(flatten)]
    pub logging: LogArgs,

    /// defaults to `supervise`
    #[command(subcommand)]
    pub command: Option<Mode>,
}

#[derive(Debug, Clone, Args)]
pub struct LogArgs {
    /// log4rs yaml file; config/log4rs.yaml is used when present
    #[arg(long, global = true)]
    pub log_config: Option<PathBuf>,

    /// root level when no log4rs file is used
    #[arg(long, global = true, default_value = "info")]
    pub log_level: LevelFilter,
}

impl LogArgs {
    /// the flags a worker needs to log the same way as its supervisor
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--log-level".to_string(), self.log_level.to_string()];
        if let Some(path) = &self.log_config {
            args.push("--log-config".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Mode {
    /// run a pool of worker processes, one per core by default
    Supervise {
        #[command(flatten)]
        pool: PoolArgs,
        #[command(flatten)]
        service: ServiceArgs,
    },
    /// run a single worker; announces readiness on stdout for the supervisor
    Worker(ServiceArgs),
    /// run a single worker in the foreground
    Serve(ServiceArgs),
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Supervise {
            pool: PoolArgs::default(),
            service: ServiceArgs::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// per-process in-memory store
    Memory,
    /// shared redis server
    Redis,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct ServiceArgs {
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: IpAddr,

    /// port of the cache-aside service
    #[arg(long, default_value_t = DEFAULT_DATA_PORT)]
    pub data_port: u16,

    /// port of the probe service
    #[arg(long, default_value_t = DEFAULT_PROBE_PORT)]
    pub probe_port: u16,

    #[arg(long, value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    #[arg(long, env = "CACHE_CLUSTER_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// how long fetched values stay cached
    #[arg(long, default_value_t = DEFAULT_TTL_SECS,
          value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_SECS))]
    pub ttl_secs: u64,

    /// upper bound on one upstream fetch, 0 to wait forever
    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT_MS)]
    pub fetch_timeout_ms: u64,

    /// simulated upstream latency
    #[arg(long, default_value_t = DEFAULT_SOURCE_DELAY_MS)]
    pub source_delay_ms: u64,

    /// key served by `GET /data`
    #[arg(long, default_value = DEFAULT_KEY)]
    pub default_key: String,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        ServiceArgs {
            host: IpAddr::from([0, 0, 0, 0]),
            data_port: DEFAULT_DATA_PORT,
            probe_port: DEFAULT_PROBE_PORT,
            store: StoreKind::Memory,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            ttl_secs: DEFAULT_TTL_SECS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            source_delay_ms: DEFAULT_SOURCE_DELAY_MS,
            default_key: DEFAULT_KEY.to_string(),
        }
    }
}

impl ServiceArgs {
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.data_port)
    }

    pub fn probe_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.probe_port)
    }

    pub fn source_delay(&self) -> Duration {
        Duration::from_millis(self.source_delay_ms)
    }

    pub fn read_through(&self) -> ReadThroughConfig {
        let fetch_timeout = match self.fetch_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        ReadThroughConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            fetch_timeout,
        }
    }

    /// the flags that reproduce this config in a worker process
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--host".to_string(),
            self.host.to_string(),
            "--data-port".to_string(),
            self.data_port.to_string(),
            "--probe-port".to_string(),
            self.probe_port.to_string(),
            "--store".to_string(),
            self.store.as_str().to_string(),
            "--redis-url".to_string(),
            self.redis_url.clone(),
            "--ttl-secs".to_string(),
            self.ttl_secs.to_string(),
            "--fetch-timeout-ms".to_string(),
            self.fetch_timeout_ms.to_string(),
            "--source-delay-ms".to_string(),
            self.source_delay_ms.to_string(),
            "--default-key".to_string(),
            self.default_key.clone(),
        ]
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct PoolArgs {
    /// number of worker processes, defaults to the core count
    #[arg(long)]
    pub workers: Option<usize>,

    /// log worker exits without replacing the worker
    #[arg(long)]
    pub no_restart: bool,

    #[arg(long, default_value_t = DEFAULT_RESTART_DELAY_MS)]
    pub restart_delay_ms: u64,
}

impl Default for PoolArgs {
    fn default() -> Self {
        PoolArgs {
            workers: None,
            no_restart: false,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
        }
    }
}

impl PoolArgs {
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            worker_count: self.workers.unwrap_or_else(core_count),
            restart: !self.no_restart,
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            ..SupervisorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["cache-cluster"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.logging.log_level, LevelFilter::Info);

        let Mode::Supervise { pool, service } = Mode::default() else {
            panic!("default mode should supervise");
        };
        assert_eq!(service.data_addr().to_string(), "0.0.0.0:3000");
        assert_eq!(service.probe_addr().port(), 8000);
        assert_eq!(service.read_through().ttl, Duration::from_secs(3600));
        assert_eq!(pool.supervisor().worker_count, core_count());
        assert!(pool.supervisor().restart);
    }

    #[test]
    fn clap_defaults_match_default_impl() {
        let cli = Cli::parse_from(["cache-cluster", "serve"]);
        let Some(Mode::Serve(service)) = cli.command else {
            panic!("expected serve");
        };
        let expected = ServiceArgs::default();
        assert_eq!(
            serde_json::to_string(&service).unwrap(),
            serde_json::to_string(&expected).unwrap()
        );
    }

    #[test]
    fn worker_args_round_trip() {
        let service = ServiceArgs {
            store: StoreKind::Redis,
            data_port: 3100,
            fetch_timeout_ms: 0,
            ..ServiceArgs::default()
        };
        let logging = LogArgs {
            log_config: None,
            log_level: LevelFilter::Debug,
        };

        let mut argv = vec!["cache-cluster".to_string()];
        argv.extend(logging.to_args());
        argv.push("worker".to_string());
        argv.extend(service.to_args());

        let cli = Cli::parse_from(argv);
        assert_eq!(cli.logging.log_level, LevelFilter::Debug);
        let Some(Mode::Worker(parsed)) = cli.command else {
            panic!("expected worker");
        };
        assert_eq!(parsed.store, StoreKind::Redis);
        assert_eq!(parsed.data_port, 3100);
        assert_eq!(parsed.read_through().fetch_timeout, None);
    }

    #[test]
    fn ttl_is_bounded() {
        let parsed = Cli::try_parse_from(["cache-cluster", "serve", "--ttl-secs", "0"]);
        assert!(parsed.is_err());

        let too_long = u64::MAX.to_string();
        let parsed = Cli::try_parse_from(["cache-cluster", "serve", "--ttl-secs", too_long.as_str()]);
        assert!(parsed.is_err());

        let max = MAX_TTL_SECS.to_string();
        let cli = Cli::try_parse_from(["cache-cluster", "serve", "--ttl-secs", max.as_str()]).unwrap();
        let Some(Mode::Serve(service)) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(service.read_through().ttl, Duration::from_secs(MAX_TTL_SECS));
    }

    #[test]
    fn supervise_flags() {
        let cli = Cli::parse_from([
            "cache-cluster",
            "supervise",
            "--workers",
            "4",
            "--no-restart",
        ]);
        let Some(Mode::Supervise { pool, .. }) = cli.command else {
            panic!("expected supervise");
        };
        let config = pool.supervisor();
        assert_eq!(config.worker_count, 4);
        assert!(!config.restart);
    }
}
