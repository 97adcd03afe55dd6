use anyhow::{anyhow, Result};
use async_channel::{bounded, unbounded, Receiver, Sender};
use async_process::{Child, Command as Process, ExitStatus, Stdio};
use async_std::io::BufReader;
use async_std::prelude::*;
use futures::future::{self, Either};
use log::*;
use serde::{Deserialize, Serialize};
use service_uptime::Uptime;
use std::path::PathBuf;
use std::time::Duration;

use crate::worker::{parse_ready_line, WorkerState, WorkerStatus, SLOT_ENV};

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// the process every worker slot runs
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> WorkerCommand {
        WorkerCommand {
            program: program.into(),
            args: vec![],
            envs: vec![],
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> WorkerCommand {
        self.args.push(arg.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> WorkerCommand {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub worker_count: usize,
    pub restart: bool,
    pub restart_delay: Duration,
    /// lifecycle events held for `events()`; newer events are dropped while it is full
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            worker_count: core_count(),
            restart: true,
            restart_delay: DEFAULT_RESTART_DELAY,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// number of cores available to this process, at least 1
pub fn core_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// what the supervisor observed about a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Spawned { slot: usize, pid: u32 },
    Listening { slot: usize, pid: u32 },
    Exited { slot: usize, pid: u32, cause: String },
    Crashed { slot: usize, pid: u32, cause: String },
    Respawned { slot: usize, pid: u32, restarts: u32 },
    Stopped { slot: usize, pid: u32 },
}

#[derive(Debug)]
enum Command {
    Status(Sender<Vec<WorkerStatus>>),
    Shutdown(Sender<()>),
    // from the per-worker tasks
    Ready(usize, u32),
    Exit(usize, u32, std::io::Result<ExitStatus>),
    Respawn(usize),
}

#[derive(Debug)]
struct Slot {
    pid: u32,
    state: WorkerState,
    uptime: Uptime,
    restarts: u32,
    stop_tx: Option<Sender<()>>,
}

impl Slot {
    fn status(&self, slot: usize) -> WorkerStatus {
        WorkerStatus::new(slot, self.pid, self.state, self.uptime.to_string(), self.restarts)
    }
}

// start one worker process and the tasks that watch its stdout and its exit
fn spawn_worker(slot: usize, cmd: &WorkerCommand, request_tx: &Sender<Command>) -> Result<Slot> {
    let mut process = Process::new(&cmd.program);
    process
        .args(&cmd.args)
        .envs(cmd.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(SLOT_ENV, slot.to_string())
        .env("ASYNC_STD_THREAD_COUNT", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = process.spawn()?;
    let pid = child.id();
    info!("spawned worker slot: {}, pid: {}", slot, pid);

    if let Some(stdout) = child.stdout.take() {
        let tx = request_tx.clone();
        async_std::task::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(Ok(line)) = lines.next().await {
                match parse_ready_line(&line) {
                    Some(_) => {
                        if tx.send(Command::Ready(slot, pid)).await.is_err() {
                            break;
                        }
                    }
                    None => info!("worker pid: {} says: {}", pid, line),
                }
            }
        });
    }

    let (stop_tx, stop_rx) = bounded(1);
    let tx = request_tx.clone();
    async_std::task::spawn(async move {
        let status = watch(child, stop_rx).await;
        let _ = tx.send(Command::Exit(slot, pid, status)).await;
    });

    Ok(Slot {
        pid,
        state: WorkerState::Spawned,
        uptime: Uptime::new(),
        restarts: 0,
        stop_tx: Some(stop_tx),
    })
}

// wait for the child to exit on its own, or kill it when asked to stop
async fn watch(mut child: Child, stop_rx: Receiver<()>) -> std::io::Result<ExitStatus> {
    {
        let status = child.status();
        let stop = stop_rx.recv();
        futures::pin_mut!(status, stop);
        if let Either::Left((status, _)) = future::select(status, stop).await {
            return status;
        }
    }

    if let Err(e) = child.kill() {
        warn!("kill worker pid: {} failed: {}", child.id(), e);
    }

    child.status().await
}

fn schedule_respawn(slot: usize, delay: Duration, request_tx: Sender<Command>) {
    // jitter keeps a crash-looping pool from respawning in lockstep
    let jitter = Duration::from_millis(fastrand::u64(0..=delay.as_millis() as u64 / 4));
    async_std::task::spawn(async move {
        async_std::task::sleep(delay + jitter).await;
        let _ = request_tx.send(Command::Respawn(slot)).await;
    });
}

struct Monitor {
    config: SupervisorConfig,
    command: WorkerCommand,
    slots: Vec<Slot>,
    request_tx: Sender<Command>,
    events_tx: Sender<LifecycleEvent>,
    shutdown_reply: Option<Sender<()>>,
}

impl Monitor {
    fn publish(&self, event: LifecycleEvent) {
        debug!("lifecycle event: {:?}", event);
        if let Err(e) = self.events_tx.try_send(event) {
            debug!("lifecycle event dropped: {:?}", e.into_inner());
        }
    }

    fn all_down(&self) -> bool {
        self.slots.iter().all(|s| !s.state.is_alive())
    }

    fn on_ready(&mut self, slot: usize, pid: u32) {
        let Some(s) = self.slots.get_mut(slot) else {
            return;
        };
        if s.pid == pid && s.state == WorkerState::Spawned {
            s.state = WorkerState::Listening;
            info!("worker slot: {}, pid: {} listening", slot, pid);
            self.publish(LifecycleEvent::Listening { slot, pid });
        }
    }

    fn on_exit(&mut self, slot: usize, pid: u32, status: std::io::Result<ExitStatus>) {
        let shutting_down = self.shutdown_reply.is_some();
        let Some(s) = self.slots.get_mut(slot) else {
            return;
        };
        if s.pid != pid {
            debug!("ignoring exit of replaced worker pid: {}", pid);
            return;
        }
        s.stop_tx = None;

        let cause = match &status {
            Ok(st) => st.to_string(),
            Err(e) => format!("wait failed: {}", e),
        };

        let event = if shutting_down {
            s.state = WorkerState::Shutdown;
            info!("worker slot: {}, pid: {} stopped ({})", slot, pid, cause);
            LifecycleEvent::Stopped { slot, pid }
        } else if matches!(&status, Ok(st) if st.success()) {
            s.state = WorkerState::Exited;
            warn!("worker slot: {}, pid: {} exited ({})", slot, pid, cause);
            LifecycleEvent::Exited { slot, pid, cause }
        } else {
            s.state = WorkerState::Crashed;
            error!("worker slot: {}, pid: {} crashed ({})", slot, pid, cause);
            LifecycleEvent::Crashed { slot, pid, cause }
        };
        self.publish(event);

        if !shutting_down && self.config.restart {
            schedule_respawn(slot, self.config.restart_delay, self.request_tx.clone());
        }
    }

    fn on_respawn(&mut self, slot: usize) {
        if self.shutdown_reply.is_some() || slot >= self.slots.len() {
            return;
        }
        if self.slots[slot].state.is_alive() {
            return;
        }

        match spawn_worker(slot, &self.command, &self.request_tx) {
            Ok(mut fresh) => {
                fresh.restarts = self.slots[slot].restarts + 1;
                let (pid, restarts) = (fresh.pid, fresh.restarts);
                self.slots[slot] = fresh;
                info!("respawned worker slot: {}, pid: {}, restarts: {}", slot, pid, restarts);
                self.publish(LifecycleEvent::Respawned {
                    slot,
                    pid,
                    restarts,
                });
            }
            Err(e) => {
                error!("respawn of worker slot: {} failed: {:?}", slot, e);
                schedule_respawn(slot, self.config.restart_delay, self.request_tx.clone());
            }
        }
    }

    async fn on_shutdown(&mut self, reply: Sender<()>) {
        info!("shutting down {} workers", self.slots.len());
        self.shutdown_reply = Some(reply);
        for s in self.slots.iter_mut() {
            match s.stop_tx.take() {
                Some(stop) => {
                    let _ = stop.send(()).await;
                }
                None => s.state = WorkerState::Shutdown,
            }
        }
    }

    fn statuses(&self) -> Vec<WorkerStatus> {
        self.slots
            .iter()
            .enumerate()
            .map(|(slot, s)| s.status(slot))
            .collect()
    }
}

// the supervisor loop
async fn handler(mut monitor: Monitor, rx: Receiver<Command>) -> Result<()> {
    while let Ok(cmd) = rx.recv().await {
        match cmd {
            Command::Status(tx) => {
                if tx.send(monitor.statuses()).await.is_err() {
                    error!("error returning status to channel");
                }
            }
            Command::Ready(slot, pid) => monitor.on_ready(slot, pid),
            Command::Exit(slot, pid, status) => monitor.on_exit(slot, pid, status),
            Command::Respawn(slot) => monitor.on_respawn(slot),
            Command::Shutdown(reply) => monitor.on_shutdown(reply).await,
        }

        if monitor.shutdown_reply.is_some() && monitor.all_down() {
            break;
        }
    }

    if let Some(reply) = monitor.shutdown_reply.take() {
        let _ = reply.send(()).await;
    }
    info!("supervisor stopped");
    rx.close();

    Ok(())
}

/// owns a fixed size pool of worker processes and keeps it at that size.
///
/// Each slot runs one process. When a process exits the supervisor logs it,
/// publishes a lifecycle event and, unless restarts are disabled or the pool is
/// shutting down, spawns a replacement into the same slot.
#[derive(Debug)]
pub struct Supervisor {
    pub pool_size: usize,
    request_tx: Sender<Command>,
    events_rx: Receiver<LifecycleEvent>,
}

impl Supervisor {
    /// spawn `config.worker_count` workers and start supervising them
    pub async fn start(config: SupervisorConfig, command: WorkerCommand) -> Result<Supervisor> {
        if config.worker_count == 0 {
            return Err(anyhow!("worker count must be at least 1"));
        }

        let (request_tx, request_rx) = unbounded();
        let (events_tx, events_rx) = bounded(config.event_buffer.max(1));

        let mut slots = Vec::with_capacity(config.worker_count);
        for slot in 0..config.worker_count {
            let s = spawn_worker(slot, &command, &request_tx)?;
            let _ = events_tx.try_send(LifecycleEvent::Spawned { slot, pid: s.pid });
            slots.push(s);
        }

        let pool_size = slots.len();
        info!("supervisor started with {} workers", pool_size);

        let monitor = Monitor {
            config,
            command,
            slots,
            request_tx: request_tx.clone(),
            events_tx,
            shutdown_reply: None,
        };

        async_std::task::spawn(async move {
            if let Err(e) = handler(monitor, request_rx).await {
                error!("supervisor exit with error: {:?}", e);
            }
        });

        Ok(Supervisor {
            pool_size,
            request_tx,
            events_rx,
        })
    }

    /// lifecycle events in the order the supervisor observed them.
    ///
    /// The buffer holds `event_buffer` events; while nobody drains it, newer
    /// events are dropped and the supervisor keeps running.
    pub fn events(&self) -> Receiver<LifecycleEvent> {
        self.events_rx.clone()
    }

    pub async fn status(&self) -> Result<Vec<WorkerStatus>> {
        let (tx, rx) = bounded(1);
        self.request_tx.send(Command::Status(tx)).await?;
        Ok(rx.recv().await?)
    }

    /// number of workers currently spawned or listening
    pub async fn live_count(&self) -> Result<usize> {
        let status = self.status().await?;
        Ok(status.iter().filter(|s| s.state.is_alive()).count())
    }

    /// stop every worker and wait for them to exit
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.request_tx.send(Command::Shutdown(tx)).await?;
        rx.recv().await?;
        Ok(())
    }
}
