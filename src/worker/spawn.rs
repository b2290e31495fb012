//! Forking sibling workers from generation zero.
//!
//! The child only keeps the forking thread. It must not touch anything the
//! parent's other threads may hold (queue, hook data, broker), so it starts
//! from a [`WorkerFactory`] that carries exactly what a fresh worker needs.

use std::sync::Arc;

use nix::unistd::{ForkResult, Pid, fork};

use super::hooks::Hooks;
use super::ipc::{IpcChannel, PipeFd};
use super::process::{Worker, WorkerPipes};
use super::server::{Server, ServerFactory};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

/// Everything a forked sibling needs to become a worker.
pub struct WorkerFactory {
    pub index: usize,
    pub master: String,
    /// Duplicate of the parent-liveness descriptor.
    pub check: Option<PipeFd>,
    /// Status channel on its own duplicate descriptor.
    pub status: IpcChannel,
    pub config: WorkerConfig,
    /// The already booted server, reused by the sibling.
    pub server: Arc<dyn Server>,
    pub hooks: Arc<dyn Hooks>,
}

impl WorkerFactory {
    /// Build the sibling's worker. Siblings are never fork-capable.
    pub fn into_worker(self) -> Worker {
        let server = self.server;
        let factory = {
            let server = server.clone();
            move || -> Result<Arc<dyn Server>> { Ok(server.clone()) }
        };
        let factory: Arc<dyn ServerFactory> = Arc::new(factory);

        let pipes = WorkerPipes {
            status: self.status,
            check: self.check,
        };

        Worker::new(
            self.index,
            self.master,
            pipes,
            self.config.with_fork_worker(false),
            factory,
        )
        .with_server(server)
        .with_hooks(self.hooks)
    }
}

/// Creates sibling worker processes.
pub trait Forker: Send + Sync {
    /// Start a sibling and return its pid. Returns only in the parent.
    fn fork(&self, factory: WorkerFactory) -> Result<Pid>;
}

/// Forks with `fork(2)`; the child runs the sibling and exits with its code.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsForker;

impl Forker for OsForker {
    fn fork(&self, factory: WorkerFactory) -> Result<Pid> {
        let index = factory.index;

        // SAFETY: the child only runs a worker built from `factory` and exits,
        // never returning into the caller's stack.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => factory.into_worker().run().terminate(),
            Err(source) => Err(WorkerError::Fork { index, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::hooks::NoHooks;
    use crate::worker::ipc::pipe;
    use crate::worker::server::IdleServer;

    #[test]
    fn test_factory_builds_plain_sibling() {
        let (_read_fd, write_fd) = pipe().unwrap();
        let factory = WorkerFactory {
            index: 3,
            master: "100".to_string(),
            check: None,
            status: IpcChannel::new(write_fd),
            config: WorkerConfig::new().with_fork_worker(true).with_tag("t"),
            server: IdleServer::arc(2),
            hooks: Arc::new(NoHooks),
        };

        let worker = factory.into_worker();
        assert_eq!(worker.index(), 3);
        assert!(!worker.is_fork_capable());
        assert_eq!(worker.title(), "cluster worker 3: 100 [t]");
    }
}
