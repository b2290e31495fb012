//! The worker process: boot, consume lifecycle commands, shut down.
//!
//! ```text
//! thread name, signal mask, parent watch
//!   └─► before_worker_boot ─► boot server ─► [fork broker] ─► b<pid>:<idx> ─► signal thread
//!         └─► consume loop (one queue mutex)
//!               Restart   run generation + reporter, unlock, join generation
//!               Spawn(n)  before_worker_fork ─► fork ─► after_worker_fork ─► f<child>:<n>
//!               Stopped   leave the loop
//!         └─► before_worker_shutdown ─► t<pid> ─► close
//! ```

use std::error::Error as _;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use super::broker::ForkBroker;
use super::hooks::{HookData, HookKind, Hooks, NoHooks, run_hook};
use super::ipc::{IpcChannel, LineReader, PipeFd};
use super::protocol::{IpcMessage, WorkerCommand};
use super::queue::{CommandQueue, QueueState};
use super::server::{Server, ServerFactory};
use super::signals::SignalRouter;
use super::spawn::{Forker, OsForker, WorkerFactory};
use super::status::StatusReporter;
use super::watchdog::ParentWatch;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

/// How a worker's run ended. Maps to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Reached `Stopped`.
    Graceful,
    /// The parent was gone before the boot message could be written.
    ParentGone,
    /// The server could not be booted.
    BootFailed,
    /// Setup or a server generation failed.
    Failed,
    /// A sibling could not be forked; leave without any cleanup.
    ForkFailed,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Graceful | Self::ParentGone => 0,
            Self::BootFailed | Self::Failed | Self::ForkFailed => 1,
        }
    }

    /// End the process with this exit's status.
    pub fn terminate(self) -> ! {
        match self {
            // no atexit handlers, no buffered output from the parent image
            // SAFETY: _exit(2) only ends the process; no handlers or destructors run.
            Self::ForkFailed => unsafe { libc::_exit(self.code()) },
            other => std::process::exit(other.code()),
        }
    }
}

/// Pipes shared with the parent.
pub struct WorkerPipes {
    /// Worker → parent status lines.
    pub status: IpcChannel,
    /// Read end of the parent-liveness pipe.
    pub check: Option<PipeFd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plumbing {
    /// Real process: thread name, signal mask and thread, parent watch.
    Os,
    /// Inside a host process: no process-wide side effects.
    InProcess,
}

/// One worker of a pre-forking cluster.
pub struct Worker {
    index: usize,
    master: String,
    pipes: WorkerPipes,
    config: WorkerConfig,
    factory: Arc<dyn ServerFactory>,
    server: Option<Arc<dyn Server>>,
    hooks: Arc<dyn Hooks>,
    hook_data: Arc<Mutex<HookData>>,
    forker: Arc<dyn Forker>,
    fork_pipe: Option<LineReader>,
    wakeup: Option<IpcChannel>,
    queue: Arc<CommandQueue>,
}

impl Worker {
    pub fn new(
        index: usize,
        master: String,
        pipes: WorkerPipes,
        config: WorkerConfig,
        factory: Arc<dyn ServerFactory>,
    ) -> Self {
        let queue = Arc::new(CommandQueue::for_worker(config.is_fork_capable(index)));
        Self {
            index,
            master,
            pipes,
            config,
            factory,
            server: None,
            hooks: Arc::new(NoHooks),
            hook_data: Arc::new(Mutex::new(HookData::new())),
            forker: Arc::new(OsForker),
            fork_pipe: None,
            wakeup: None,
            queue,
        }
    }

    /// Use an already booted server instead of calling the factory.
    pub fn with_server(mut self, server: Arc<dyn Server>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_forker(mut self, forker: Arc<dyn Forker>) -> Self {
        self.forker = forker;
        self
    }

    /// Read end of the parent's fork-request pipe (fork-capable worker only).
    pub fn with_fork_pipe(mut self, fork_pipe: PipeFd) -> Self {
        self.fork_pipe = Some(LineReader::new(fork_pipe));
        self
    }

    /// Channel used to wake the parent after reaping siblings.
    pub fn with_wakeup(mut self, wakeup: IpcChannel) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation zero of a fork-worker cluster.
    pub fn is_fork_capable(&self) -> bool {
        self.config.is_fork_capable(self.index)
    }

    /// The command queue driving this worker.
    pub fn queue(&self) -> Arc<CommandQueue> {
        Arc::clone(&self.queue)
    }

    /// Short thread name shown by `ps -o comm`; the kernel keeps 15 bytes.
    pub fn comm(&self) -> String {
        format!("wrkr {}", self.index)
    }

    /// Process title: `cluster worker <index>: <master>` plus ` [<tag>]`.
    ///
    /// Too long for the kernel's comm field, so it only goes to the logs.
    pub fn title(&self) -> String {
        let mut title = format!("cluster worker {}: {}", self.index, self.master);
        if let Some(tag) = self.config.display_tag() {
            title.push_str(&format!(" [{tag}]"));
        }
        title
    }

    /// Run the worker in this process.
    ///
    /// Installs the signal mask and the parent watch. Call from the main thread
    /// before any other thread exists.
    pub fn run(self) -> WorkerExit {
        self.execute(Plumbing::Os)
    }

    /// Run embedded in a host process.
    ///
    /// Leaves signals, the thread name and the liveness pipe alone; the host
    /// routes termination through [`SignalRouter::handle`].
    pub fn run_in_process(self) -> WorkerExit {
        self.execute(Plumbing::InProcess)
    }

    fn execute(mut self, plumbing: Plumbing) -> WorkerExit {
        let pid = std::process::id() as i32;
        let index = self.index;
        let fork_capable = self.is_fork_capable();
        let ipc = self.pipes.status.clone();
        info!(index, pid, title = %self.title(), "Worker starting");

        let check = match self.prepare_process(plumbing, fork_capable) {
            Ok(check) => check,
            Err(e) => {
                log_failure("Worker setup failed", &e);
                self.farewell(pid);
                return WorkerExit::Failed;
            }
        };

        self.call_hook(HookKind::BeforeWorkerBoot, Some(index));

        let booted = match self.server.take() {
            Some(server) => Ok(server),
            None => self.factory.build(),
        };
        let server = match booted {
            Ok(server) => server,
            Err(e) => {
                log_failure("Worker failed to boot", &e);
                self.farewell(pid);
                return WorkerExit::BootFailed;
            }
        };

        if let Err(e) = self.start_fork_broker(fork_capable, &server) {
            log_failure("Worker setup failed", &e);
            self.farewell(pid);
            return WorkerExit::Failed;
        }

        if let Err(e) = ipc.send(&IpcMessage::Boot { pid, index }) {
            error!(index, error = %e, "Boot failed, parent seems to have exited");
            self.farewell(pid);
            return WorkerExit::ParentGone;
        }
        info!(index, pid, "Worker booted");

        // a SIGTERM from boot time stays pending until here, so `e` follows `b`
        if plumbing == Plumbing::Os
            && let Err(e) = self.signal_router(pid, &server).spawn(fork_capable)
        {
            log_failure("Worker setup failed", &e);
            self.farewell(pid);
            return WorkerExit::Failed;
        }

        let queue = self.queue();
        let mut reporter: Option<StatusReporter> = None;
        let exit = loop {
            let (command, mut state) = queue.pop();
            match command {
                WorkerCommand::Stopped => break WorkerExit::Graceful,
                WorkerCommand::Restart => {
                    let generation = match server.run() {
                        Ok(generation) => generation,
                        Err(e) => {
                            log_failure("Server failed to start", &e);
                            break WorkerExit::Failed;
                        }
                    };
                    if reporter.is_none() {
                        reporter = StatusReporter::spawn(
                            ipc.clone(),
                            Arc::clone(&server),
                            self.config.worker_check_interval,
                            pid,
                        )
                        .inspect_err(|e| warn!(error = %e, "Could not start status reporter"))
                        .ok();
                    }
                    debug!(index, "Server started");
                    drop(state);

                    if generation.join().is_err() {
                        error!(index, "Server generation panicked");
                    }
                    debug!(index, "Server generation ended");
                }
                WorkerCommand::Spawn(idx) => {
                    if !fork_capable {
                        warn!(index, idx, "Ignoring spawn request, this worker cannot fork");
                        continue;
                    }
                    // the child must not inherit a reporter mid-write
                    if let Some(mut paused) = reporter.take() {
                        paused.shutdown();
                    }
                    if let Err(e) = self.spawn_sibling(idx, check.as_ref(), &server, &mut state) {
                        error!(idx, error = %e, "Could not fork worker");
                        error!(index, "Worker {} exiting, fork failed", index);
                        return WorkerExit::ForkFailed;
                    }
                }
            }
        };

        self.call_hook(HookKind::BeforeWorkerShutdown, Some(index));
        if let Some(mut reporter) = reporter {
            reporter.shutdown();
        }
        self.farewell(pid);
        info!(index, pid, ?exit, "Worker stopped");
        exit
    }

    /// Thread name, signal mask and parent watch. Returns the liveness descriptor
    /// to hand to forked siblings.
    fn prepare_process(&mut self, plumbing: Plumbing, fork_capable: bool) -> Result<Option<PipeFd>> {
        let check = self.pipes.check.take();
        if plumbing == Plumbing::InProcess {
            return Ok(check);
        }

        self.apply_comm();
        SignalRouter::mask(fork_capable)?;

        let Some(check) = check else {
            debug!(index = self.index, "No liveness pipe, parent is not watched");
            return Ok(None);
        };
        let for_children = if fork_capable {
            Some(check.try_clone()?)
        } else {
            None
        };
        ParentWatch::spawn(check, ParentWatch::hard_exit())?;
        Ok(for_children)
    }

    fn start_fork_broker(&mut self, fork_capable: bool, server: &Arc<dyn Server>) -> Result<()> {
        if !fork_capable {
            return Ok(());
        }
        match self.fork_pipe.take() {
            Some(reader) => {
                ForkBroker::new(
                    self.queue(),
                    Arc::clone(server),
                    Arc::clone(&self.hooks),
                    Arc::clone(&self.hook_data),
                )
                .spawn(reader)?;
            }
            None => warn!(index = self.index, "Fork-capable worker has no fork pipe"),
        }
        Ok(())
    }

    fn signal_router(&self, pid: i32, server: &Arc<dyn Server>) -> SignalRouter {
        SignalRouter::new(
            pid,
            self.queue(),
            self.pipes.status.clone(),
            Arc::clone(server),
            self.wakeup.clone(),
        )
    }

    /// Fork the sibling at `idx`. Runs under the queue lock.
    fn spawn_sibling(
        &self,
        idx: usize,
        check: Option<&PipeFd>,
        server: &Arc<dyn Server>,
        state: &mut QueueState,
    ) -> Result<()> {
        self.call_hook(HookKind::BeforeWorkerFork, Some(idx));

        let factory = WorkerFactory {
            index: idx,
            master: self.master.clone(),
            check: check.map(PipeFd::try_clone).transpose()?,
            status: self.pipes.status.try_duplicate()?,
            config: self.config.clone(),
            server: Arc::clone(server),
            hooks: Arc::clone(&self.hooks),
        };
        let child = self.forker.fork(factory)?;

        self.call_hook(HookKind::AfterWorkerFork, Some(idx));
        state.track_child(child);

        let message = IpcMessage::Fork {
            pid: child.as_raw(),
            index: idx,
        };
        if let Err(e) = self.pipes.status.send(&message) {
            debug!(idx, error = %e, "Could not report fork");
        }
        info!(idx, child = child.as_raw(), "Forked worker");
        Ok(())
    }

    fn call_hook(&self, kind: HookKind, index: Option<usize>) {
        let mut data = self.hook_data.lock().unwrap_or_else(PoisonError::into_inner);
        run_hook(self.hooks.as_ref(), kind, index, &mut data);
    }

    /// Best-effort `t<pid>`, then close the status channel.
    fn farewell(&self, pid: i32) {
        if let Err(e) = self.pipes.status.send(&IpcMessage::Term { pid }) {
            debug!(error = %e, "Could not report termination");
        }
        self.pipes.status.close();
    }

    fn apply_comm(&self) {
        #[cfg(target_os = "linux")]
        {
            match std::ffi::CString::new(self.comm()) {
                Ok(name) => {
                    if let Err(e) = nix::sys::prctl::set_name(&name) {
                        debug!(error = %e, "Could not set thread name");
                    }
                }
                Err(_) => debug!("Thread name contains NUL, not applied"),
            }
        }
    }
}

fn log_failure(context: &str, err: &WorkerError) {
    error!(error = %err, "{}", context);
    let mut source = err.source();
    while let Some(cause) = source {
        error!(cause = %cause, "Caused by");
        source = cause.source();
    }
}
