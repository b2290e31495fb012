//! Fork control for the generation-zero worker.
//!
//! The parent drives phased reforks by writing integers on the fork pipe:
//!
//! ```text
//!  "5"  ──► push Spawn(5)
//!  "0"  ──► push Restart, Stopped      (arms the generation)
//!  "-1" ──► if armed: clear queue, server.begin_restart(true), before_refork
//! ```
//!
//! The trailing `Stopped` after a restart means "exit when this generation
//! ends". A `-1` removes it, so a worker whose generation was stopped for a
//! refork keeps waiting for the next request instead of exiting.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use super::hooks::{HookData, HookKind, Hooks, run_hook};
use super::ipc::LineReader;
use super::protocol::{ForkRequest, WorkerCommand};
use super::queue::CommandQueue;
use super::server::Server;
use crate::error::Result;

/// Outcome of one fork request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Queued,
    /// The running generation was told to drain.
    Stopped,
    /// Nothing to do (no armed generation, or terminating).
    Ignored,
}

/// Turns fork-pipe requests into queue mutations.
#[derive(Clone)]
pub struct ForkBroker {
    queue: Arc<CommandQueue>,
    server: Arc<dyn Server>,
    hooks: Arc<dyn Hooks>,
    hook_data: Arc<Mutex<HookData>>,
}

impl ForkBroker {
    pub fn new(
        queue: Arc<CommandQueue>,
        server: Arc<dyn Server>,
        hooks: Arc<dyn Hooks>,
        hook_data: Arc<Mutex<HookData>>,
    ) -> Self {
        Self {
            queue,
            server,
            hooks,
            hook_data,
        }
    }

    /// Apply one request.
    pub fn handle(&self, request: ForkRequest) -> Handled {
        self.queue.update(|state| {
            if state.is_terminating() {
                debug!(?request, "Ignoring fork request while terminating");
                return Handled::Ignored;
            }

            match request {
                ForkRequest::Spawn(idx) => {
                    state.push(WorkerCommand::Spawn(idx));
                    Handled::Queued
                }
                ForkRequest::Restart => {
                    state.push(WorkerCommand::Restart);
                    state.push(WorkerCommand::Stopped);
                    state.arm_generation();
                    Handled::Queued
                }
                ForkRequest::Stop => {
                    if !state.take_armed_generation() {
                        debug!("No generation to stop");
                        return Handled::Ignored;
                    }
                    state.clear();
                    self.server.begin_restart(true);

                    let mut data = self.hook_data.lock().unwrap_or_else(PoisonError::into_inner);
                    run_hook(self.hooks.as_ref(), HookKind::BeforeRefork, None, &mut data);
                    info!("Stopping generation for refork");
                    Handled::Stopped
                }
            }
        })
    }

    /// Read requests from the fork pipe on the `wrkr fork` thread until EOF.
    pub fn spawn(self, mut reader: LineReader) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("wrkr fork".to_string())
            .spawn(move || {
                loop {
                    let line = match reader.read_line() {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!("Fork pipe closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Reading fork pipe failed");
                            break;
                        }
                    };

                    match ForkRequest::parse(line) {
                        Ok(request) => {
                            self.handle(request);
                        }
                        Err(e) => warn!(error = %e, "Skipping fork request"),
                    }
                }
            })?;
        Ok(handle)
    }
}
