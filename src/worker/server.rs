//! Seam to the serving engine hosted by a worker.
//!
//! The engine itself (accept loop, thread pool, request parsing) lives outside
//! this crate. A worker only needs to start a generation, stop or drain it,
//! and sample its metrics.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::debug;

use super::protocol::ServerStats;
use crate::error::{Result, WorkerError};

/// A serving engine that can run several generations over a worker's lifetime.
pub trait Server: Send + Sync + 'static {
    /// Start one generation on a dedicated thread.
    ///
    /// The returned handle resolves once the generation's run loop has returned.
    fn run(&self) -> Result<JoinHandle<()>>;

    /// Stop the running generation (no-op if none runs).
    fn stop(&self);

    /// Drain then stop: existing connections finish, new ones are refused.
    /// With `sync`, the generation ends once draining completes.
    fn begin_restart(&self, sync: bool);

    /// Current metrics.
    fn stats(&self) -> ServerStats;
}

/// Boots the server for a worker.
pub trait ServerFactory: Send + Sync {
    fn build(&self) -> Result<Arc<dyn Server>>;
}

impl<F> ServerFactory for F
where
    F: Fn() -> Result<Arc<dyn Server>> + Send + Sync,
{
    fn build(&self) -> Result<Arc<dyn Server>> {
        self()
    }
}

#[derive(Debug, Default)]
struct IdleState {
    /// Generation counter; bumping it releases the parked generation.
    generation: u64,
    running: bool,
}

/// Stand-in engine without listeners.
///
/// Each generation parks until it is stopped or restarted. Useful for
/// exercising worker lifecycles without a real serving engine.
#[derive(Debug)]
pub struct IdleServer {
    max_threads: usize,
    state: Arc<(Mutex<IdleState>, Condvar)>,
}

impl IdleServer {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            state: Arc::new((Mutex::new(IdleState::default()), Condvar::new())),
        }
    }

    /// Shared handle as a trait object.
    pub fn arc(max_threads: usize) -> Arc<dyn Server> {
        Arc::new(Self::new(max_threads))
    }

    /// Whether a generation is currently parked.
    pub fn is_running(&self) -> bool {
        let (lock, _) = &*self.state;
        lock.lock().unwrap_or_else(PoisonError::into_inner).running
    }

    fn release(&self) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if state.running {
            state.generation += 1;
            state.running = false;
            cvar.notify_all();
        }
    }
}

impl Server for IdleServer {
    fn run(&self) -> Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.state);
        let started = {
            let (lock, _) = &*shared;
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if state.running {
                return Err(WorkerError::ServerStart(
                    "a generation is already running".into(),
                ));
            }
            state.running = true;
            state.generation
        };

        thread::Builder::new()
            .name("srv idle".to_string())
            .spawn(move || {
                let (lock, cvar) = &*shared;
                let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
                while state.generation == started {
                    state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                debug!(generation = started, "Idle generation finished");
            })
            .map_err(|e| WorkerError::ServerStart(e.to_string()))
    }

    fn stop(&self) {
        self.release();
    }

    fn begin_restart(&self, _sync: bool) {
        self.release();
    }

    fn stats(&self) -> ServerStats {
        ServerStats {
            backlog: 0,
            running: if self.is_running() { self.max_threads } else { 0 },
            pool_capacity: self.max_threads,
            max_threads: self.max_threads,
            requests_count: 0,
        }
    }
}
