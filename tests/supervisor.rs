/// integration tests to ensure workers are spawned, reach Listening, and are
/// replaced when they die
///
use async_channel::Receiver;
use std::time::Duration;

use cache_cluster::cluster::{LifecycleEvent, Supervisor, SupervisorConfig, WorkerCommand};
use cache_cluster::worker::{WorkerState, DOWN, OK};

const WAIT: Duration = Duration::from_secs(10);

// a stand-in worker: announces itself like a real one, then idles
fn idle_worker() -> WorkerCommand {
    WorkerCommand::new("/bin/sh")
        .arg("-c")
        .arg("echo listening $$; exec sleep 30")
}

fn config(worker_count: usize) -> SupervisorConfig {
    SupervisorConfig {
        worker_count,
        restart: true,
        restart_delay: Duration::from_millis(50),
        ..SupervisorConfig::default()
    }
}

async fn next_event(events: &Receiver<LifecycleEvent>) -> LifecycleEvent {
    async_std::future::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a lifecycle event")
        .expect("event stream closed")
}

// collect events until `n` of them match
async fn wait_for<F>(events: &Receiver<LifecycleEvent>, n: usize, pred: F) -> Vec<LifecycleEvent>
where
    F: Fn(&LifecycleEvent) -> bool,
{
    let mut matched = vec![];
    while matched.len() < n {
        let event = next_event(events).await;
        println!("{:?}", event);
        if pred(&event) {
            matched.push(event);
        }
    }
    matched
}

fn kill(pid: u32) {
    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .expect("kill should run");
    assert!(status.success());
}

#[test]
fn single_worker() {
    async_std::task::block_on(async move {
        let supervisor = Supervisor::start(config(1), idle_worker())
            .await
            .expect("should create the supervisor");
        assert_eq!(supervisor.pool_size, 1);

        let events = supervisor.events();
        wait_for(&events, 1, |e| matches!(e, LifecycleEvent::Listening { .. })).await;

        // now get the status, should be ok
        let status = supervisor.status().await.unwrap();
        println!("{:?}", status);
        assert_eq!(status.len(), 1);
        for sts in status.iter() {
            assert_eq!(sts.slot, 0);
            assert!(sts.pid > 0);
            assert_eq!(sts.status, OK);
            assert_eq!(sts.state, WorkerState::Listening);
            assert!(sts.uptime.starts_with("0 days, 00:00"));
            assert_eq!(sts.restarts, 0);
        }

        // shut down
        assert!(supervisor.shutdown().await.is_ok());
        let stopped = wait_for(&events, 1, |e| matches!(e, LifecycleEvent::Stopped { .. })).await;
        assert_eq!(stopped.len(), 1);
    });
}

#[test]
fn worker_pool() {
    async_std::task::block_on(async move {
        let supervisor = Supervisor::start(config(4), idle_worker())
            .await
            .expect("should create the supervisor");
        let events = supervisor.events();

        // every slot reaches Listening
        let listening =
            wait_for(&events, 4, |e| matches!(e, LifecycleEvent::Listening { .. })).await;
        assert_eq!(listening.len(), 4);
        assert_eq!(supervisor.live_count().await.unwrap(), 4);

        // kill one worker
        let status = supervisor.status().await.unwrap();
        let victim = status[2].pid;
        kill(victim);

        let crashed = wait_for(&events, 1, |e| matches!(e, LifecycleEvent::Crashed { .. })).await;
        match &crashed[0] {
            LifecycleEvent::Crashed { slot, pid, cause } => {
                assert_eq!(*slot, 2);
                assert_eq!(*pid, victim);
                assert!(cause.contains("signal"), "cause: {}", cause);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // a replacement takes the slot and the pool is back to 4
        let respawned =
            wait_for(&events, 1, |e| matches!(e, LifecycleEvent::Respawned { .. })).await;
        let LifecycleEvent::Respawned { slot, pid, restarts } = respawned[0].clone() else {
            panic!("expected a respawn");
        };
        assert_eq!(slot, 2);
        assert_ne!(pid, victim);
        assert_eq!(restarts, 1);

        wait_for(&events, 1, |e| matches!(e, LifecycleEvent::Listening { slot: 2, .. })).await;
        assert_eq!(supervisor.live_count().await.unwrap(), 4);

        let status = supervisor.status().await.unwrap();
        assert_eq!(status[2].pid, pid);
        assert_eq!(status[2].restarts, 1);
        assert_eq!(status[2].state, WorkerState::Listening);

        // shutdown stops everything without respawning
        assert!(supervisor.shutdown().await.is_ok());
        let stopped = wait_for(&events, 4, |e| matches!(e, LifecycleEvent::Stopped { .. })).await;
        assert_eq!(stopped.len(), 4);
    });
}

#[test]
fn no_restart_leaves_slot_down() {
    async_std::task::block_on(async move {
        let config = SupervisorConfig {
            restart: false,
            ..config(2)
        };
        let supervisor = Supervisor::start(config, idle_worker()).await.unwrap();
        let events = supervisor.events();
        wait_for(&events, 2, |e| matches!(e, LifecycleEvent::Listening { .. })).await;

        let victim = supervisor.status().await.unwrap()[0].pid;
        kill(victim);
        wait_for(&events, 1, |e| matches!(e, LifecycleEvent::Crashed { .. })).await;

        // wait past the restart delay; nothing comes back
        async_std::task::sleep(Duration::from_millis(300)).await;
        let status = supervisor.status().await.unwrap();
        assert_eq!(status[0].state, WorkerState::Crashed);
        assert_eq!(status[0].status, DOWN);
        assert_eq!(supervisor.live_count().await.unwrap(), 1);

        assert!(supervisor.shutdown().await.is_ok());
    });
}
