//! Signal routing for a worker process.
//!
//! No work happens in async-signal context. The routed signals are blocked in
//! every worker thread and a dedicated `wrkr signals` thread picks them up with
//! `sigwait`, then locks the command queue like any other thread:
//!
//! ```text
//! SIGTERM ──► lock ─► e<pid> ─► terminate + clear ─► server.stop() ─► push(Stopped)
//! SIGCHLD ──► lock ─► waitpid(WNOHANG) per tracked child ─► wake parent if any reaped
//! SIGINT  ──► ignored (the parent owns interrupt semantics)
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use tracing::{debug, info, warn};

use super::ipc::IpcChannel;
use super::protocol::IpcMessage;
use super::queue::CommandQueue;
use super::server::Server;
use crate::error::Result;

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled(Signal),
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
        }
    }
}

/// The termination reason for a final wait status, `None` while the child lives on.
pub fn analyze_wait_status(status: WaitStatus) -> Option<TerminationReason> {
    match status {
        WaitStatus::Exited(_, code) => Some(TerminationReason::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(TerminationReason::Signaled(signal)),
        _ => None,
    }
}

/// Routes SIGTERM and SIGCHLD into queue mutations for one worker.
#[derive(Clone)]
pub struct SignalRouter {
    pid: i32,
    queue: Arc<CommandQueue>,
    ipc: IpcChannel,
    server: Arc<dyn Server>,
    wakeup: Option<IpcChannel>,
}

impl SignalRouter {
    pub fn new(
        pid: i32,
        queue: Arc<CommandQueue>,
        ipc: IpcChannel,
        server: Arc<dyn Server>,
        wakeup: Option<IpcChannel>,
    ) -> Self {
        Self {
            pid,
            queue,
            ipc,
            server,
            wakeup,
        }
    }

    /// Signals delivered to the router thread.
    pub fn routed(fork_capable: bool) -> SigSet {
        let mut set = SigSet::empty();
        set.add(Signal::SIGTERM);
        if fork_capable {
            set.add(Signal::SIGCHLD);
        }
        set
    }

    /// Set process-wide dispositions and block the routed signals in the calling thread.
    ///
    /// Must run before any other worker thread is spawned so every thread
    /// inherits the mask.
    pub fn mask(fork_capable: bool) -> Result<()> {
        // SAFETY: installing SIG_IGN / SIG_DFL runs no user code in signal context.
        unsafe {
            signal::signal(Signal::SIGINT, SigHandler::SigIgn)?;
            if !fork_capable {
                signal::signal(Signal::SIGCHLD, SigHandler::SigDfl)?;
            }
        }
        if !fork_capable {
            // a forked sibling inherits its parent's mask
            let mut chld = SigSet::empty();
            chld.add(Signal::SIGCHLD);
            chld.thread_unblock()?;
        }
        Self::routed(fork_capable).thread_block()?;
        Ok(())
    }

    /// Start the `wrkr signals` thread. Call [`SignalRouter::mask`] first.
    pub fn spawn(self, fork_capable: bool) -> Result<JoinHandle<()>> {
        let set = Self::routed(fork_capable);
        let handle = thread::Builder::new()
            .name("wrkr signals".to_string())
            .spawn(move || {
                loop {
                    match set.wait() {
                        Ok(sig) => self.handle(sig),
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => {
                            warn!(error = %e, "sigwait failed, signal routing stopped");
                            break;
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    /// Dispatch one signal.
    pub fn handle(&self, sig: Signal) {
        match sig {
            Signal::SIGTERM => self.on_terminate(),
            Signal::SIGCHLD => {
                self.on_child_exit();
            }
            other => debug!(signal = ?other, "Ignoring unrouted signal"),
        }
    }

    /// External termination: report it, then force the queue to drain and stop.
    ///
    /// The report is written under the queue lock, so a fork in flight reports
    /// first and no fork can start after it.
    pub fn on_terminate(&self) {
        self.queue.update(|state| {
            if let Err(e) = self.ipc.send(&IpcMessage::ExternalTerm { pid: self.pid }) {
                debug!(error = %e, "Could not report external term");
            }
            state.begin_termination();
            self.server.stop();
        });
        info!(pid = self.pid, "Received SIGTERM, stopping");
    }

    /// Reap exited children without blocking. Returns how many were reaped.
    pub fn on_child_exit(&self) -> usize {
        let reaped = self.queue.update(|state| {
            state.retain_children(|pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => match analyze_wait_status(status) {
                    Some(reason) if reason.is_success() => {
                        debug!(child = pid.as_raw(), %reason, "Reaped child");
                        false
                    }
                    Some(reason) => {
                        warn!(child = pid.as_raw(), %reason, "Reaped child");
                        false
                    }
                    None => true,
                },
                // already reaped elsewhere
                Err(_) => false,
            })
        });

        if reaped > 0
            && let Some(wakeup) = &self.wakeup
            && let Err(e) = wakeup.send_raw("!")
        {
            debug!(error = %e, "Could not wake parent");
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ipc::{LineReader, pipe};
    use crate::worker::protocol::WorkerCommand;
    use crate::worker::server::IdleServer;
    use nix::unistd::Pid;
    use std::process::Command;

    fn router_with(queue: Arc<CommandQueue>) -> (SignalRouter, LineReader, Arc<IdleServer>) {
        let (read_fd, write_fd) = pipe().unwrap();
        let server = Arc::new(IdleServer::new(1));
        let router = SignalRouter::new(7, queue, IpcChannel::new(write_fd), server.clone(), None);
        (router, LineReader::new(read_fd), server)
    }

    #[test]
    fn test_terminate_reports_and_stops() {
        let queue = Arc::new(CommandQueue::new([
            WorkerCommand::Spawn(2),
            WorkerCommand::Restart,
        ]));
        let (router, mut reader, server) = router_with(queue.clone());

        let generation = server.run().unwrap();
        router.handle(Signal::SIGTERM);

        assert_eq!(reader.read_line().unwrap(), Some("e7"));
        assert_eq!(queue.snapshot(), vec![WorkerCommand::Stopped]);
        generation.join().unwrap();
        assert!(!queue.push(WorkerCommand::Spawn(9)));
    }

    #[test]
    fn test_terminate_reports_after_lock_holder() {
        let queue = Arc::new(CommandQueue::for_worker(true));
        let (router, mut reader, _server) = router_with(queue.clone());
        let ipc = router.ipc.clone();

        let guard = queue.lock();
        let signals = std::thread::spawn(move || router.on_terminate());
        std::thread::sleep(std::time::Duration::from_millis(50));
        // written by the lock holder while SIGTERM waits
        ipc.send_raw("f40001:1").unwrap();
        drop(guard);
        signals.join().unwrap();

        assert_eq!(reader.read_line().unwrap(), Some("f40001:1"));
        assert_eq!(reader.read_line().unwrap(), Some("e7"));
        assert_eq!(queue.snapshot(), vec![WorkerCommand::Stopped]);
    }

    #[test]
    fn test_terminate_with_closed_channel_still_stops() {
        let queue = Arc::new(CommandQueue::for_worker(true));
        let (router, reader, _server) = router_with(queue.clone());
        drop(reader);

        router.on_terminate();
        assert_eq!(queue.snapshot(), vec![WorkerCommand::Stopped]);
    }

    #[test]
    fn test_child_exit_reaps_and_wakes() {
        let queue = Arc::new(CommandQueue::for_worker(true));
        let (wake_read, wake_write) = pipe().unwrap();
        let (router, _reader, _server) = router_with(queue.clone());
        let router = SignalRouter {
            wakeup: Some(IpcChannel::new(wake_write)),
            ..router
        };

        let mut child = Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        queue.update(|state| state.track_child(pid));

        // wait for the child to become a zombie without reaping it
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut reaped = 0;
        while reaped == 0 && std::time::Instant::now() < deadline {
            reaped = router.on_child_exit();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(reaped, 1);
        assert_eq!(queue.lock().children().count(), 0);

        let mut wake = LineReader::new(wake_read);
        assert_eq!(wake.read_line().unwrap(), Some("!"));

        // std's handle sees the child as already gone
        let _ = child.try_wait();
    }

    #[test]
    fn test_child_exit_drops_unknown_pids() {
        let queue = Arc::new(CommandQueue::for_worker(true));
        let (router, _reader, _server) = router_with(queue.clone());
        // not our child: waitpid fails with ECHILD
        queue.update(|state| state.track_child(Pid::from_raw(i32::MAX - 1)));

        assert_eq!(router.on_child_exit(), 1);
        assert_eq!(queue.lock().children().count(), 0);
    }

    #[test]
    fn test_routed_sets() {
        assert!(SignalRouter::routed(true).contains(Signal::SIGCHLD));
        assert!(!SignalRouter::routed(false).contains(Signal::SIGCHLD));
        assert!(SignalRouter::routed(false).contains(Signal::SIGTERM));
    }

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(analyze_wait_status(status), Some(TerminationReason::Exited(0)));
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(3).is_success());

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(
            analyze_wait_status(status),
            Some(TerminationReason::Signaled(Signal::SIGKILL))
        );
        assert_eq!(
            TerminationReason::Signaled(Signal::SIGKILL).to_string(),
            "killed by signal SIGKILL"
        );

        assert_eq!(analyze_wait_status(WaitStatus::StillAlive), None);
    }
}
