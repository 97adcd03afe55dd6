/// multi-process worker pool.
///
/// The supervisor starts one worker process per core. Each worker binds the same
/// ports with SO_REUSEPORT and the kernel spreads connections across them. The
/// supervisor tracks each worker through Spawned -> Listening -> Exited|Crashed
/// and respawns replacements to hold the pool at its target size.
///
pub mod supervisor;

pub use self::supervisor::{
    core_count, LifecycleEvent, Supervisor, SupervisorConfig, WorkerCommand,
};
