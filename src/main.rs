use anyhow::Result;
use clap::Parser;
use futures::future::{self, Either};
use log::*;

use cache_cluster::cluster::{Supervisor, WorkerCommand};
use cache_cluster::config::{Cli, LogArgs, Mode, PoolArgs, ServiceArgs};
use cache_cluster::{logging, service, VERSION};

#[async_std::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.logging.log_config.as_deref(), cli.logging.log_level)?;

    match cli.command.clone().unwrap_or_default() {
        Mode::Supervise { pool, service } => supervise(&cli.logging, &pool, &service).await,
        Mode::Worker(service) => service::run_worker(&service, true).await,
        Mode::Serve(service) => {
            info!("serve config: {}", serde_json::to_string(&service)?);
            service::run_worker(&service, false).await
        }
    }
}

async fn supervise(logging: &LogArgs, pool: &PoolArgs, service: &ServiceArgs) -> Result<()> {
    info!("cache-cluster version: {}", VERSION);
    info!("pool config: {}", serde_json::to_string(pool)?);
    info!("service config: {}", serde_json::to_string(service)?);

    let mut command = WorkerCommand::new(std::env::current_exe()?);
    for arg in logging.to_args() {
        command = command.arg(arg);
    }
    command = command.arg("worker");
    for arg in service.to_args() {
        command = command.arg(arg);
    }

    let supervisor = Supervisor::start(pool.supervisor(), command).await?;
    let events = supervisor.events();

    // lifecycle events are already logged by the supervisor; drain them until ctrl-c
    let drain = async move { while events.recv().await.is_ok() {} };
    let interrupt = tokio::signal::ctrl_c();
    futures::pin_mut!(drain, interrupt);

    match future::select(interrupt, drain).await {
        Either::Left((signal, _)) => {
            signal?;
            info!("interrupt received");
        }
        Either::Right(_) => warn!("supervisor event stream closed"),
    }

    supervisor.shutdown().await?;
    info!("all workers stopped");

    Ok(())
}
