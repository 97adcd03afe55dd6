/// worker support structs
///
use serde::{Deserialize, Serialize};
use std::fmt;

pub type JsonString = String;

/// the line a worker process writes to stdout once both listeners are bound
pub const READY_PREFIX: &str = "listening";

/// the env var a worker reads to learn its supervisor slot
pub const SLOT_ENV: &str = "CACHE_CLUSTER_WORKER_SLOT";

pub const OK: &str = "ok";
pub const DOWN: &str = "down";

/// per-worker lifecycle: Spawned -> Listening -> (Exited | Crashed)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    Spawned,
    Listening,
    Exited,
    Crashed,
    Shutdown,
}

impl WorkerState {
    /// true while the process is (or should be) alive
    pub fn is_alive(&self) -> bool {
        matches!(self, WorkerState::Spawned | WorkerState::Listening)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Spawned => "spawned",
            WorkerState::Listening => "listening",
            WorkerState::Exited => "exited",
            WorkerState::Crashed => "crashed",
            WorkerState::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub slot: usize,
    pub pid: u32,
    pub status: String,
    pub state: WorkerState,
    pub uptime: String,
    pub restarts: u32,
}

impl WorkerStatus {
    pub fn new(
        slot: usize,
        pid: u32,
        state: WorkerState,
        uptime: String,
        restarts: u32,
    ) -> WorkerStatus {
        let status = if state.is_alive() { OK } else { DOWN };
        WorkerStatus {
            slot,
            pid,
            status: status.to_string(),
            state,
            uptime,
            restarts,
        }
    }
}

/// parse a readiness line written by a worker; returns the reported pid
pub fn parse_ready_line(line: &str) -> Option<u32> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some(READY_PREFIX) {
        return None;
    }

    parts.next().and_then(|pid| pid.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_state() {
        let status = WorkerStatus::new(2, 1234, WorkerState::Listening, "0".to_string(), 0);
        assert_eq!(status.status, OK);

        let status = WorkerStatus::new(2, 1234, WorkerState::Crashed, "0".to_string(), 1);
        assert_eq!(status.status, DOWN);
        assert_eq!(status.restarts, 1);
    }

    #[test]
    fn ready_lines() {
        assert_eq!(parse_ready_line("listening 4242"), Some(4242));
        assert_eq!(parse_ready_line("  listening   17 \n"), Some(17));
        assert_eq!(parse_ready_line("listening"), None);
        assert_eq!(parse_ready_line("listening abc"), None);
        assert_eq!(parse_ready_line("started 17"), None);
    }

    #[test]
    fn state_json() {
        let js = serde_json::to_string(&WorkerState::Listening).unwrap();
        assert_eq!(js, r#""Listening""#);
        assert_eq!(WorkerState::Crashed.to_string(), "crashed");
        assert!(!WorkerState::Shutdown.is_alive());
    }
}
