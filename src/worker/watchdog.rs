//! Parent liveness watchdog.
//!
//! The parent keeps the write end of the liveness pipe open and never writes
//! to it. When the parent dies the kernel closes that end and the worker's
//! read end polls as readable (EOF) or hung up.

use std::os::unix::io::AsFd;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use super::ipc::PipeFd;
use crate::error::Result;

/// Action run once the parent is gone.
pub type OnParentDeath = Box<dyn FnOnce() + Send + 'static>;

/// Watches the liveness pipe on the `wrkr check` thread.
pub struct ParentWatch {
    thread: Option<JoinHandle<()>>,
}

impl ParentWatch {
    /// Start watching `check_pipe`; `on_death` runs on the watch thread.
    pub fn spawn(check_pipe: PipeFd, on_death: OnParentDeath) -> Result<Self> {
        let thread = thread::Builder::new()
            .name("wrkr check".to_string())
            .spawn(move || {
                match wait_for_hangup(&check_pipe) {
                    Ok(()) => warn!("Detected parent died, dying"),
                    Err(e) => warn!(error = %e, "Liveness pipe failed, assuming parent died"),
                }
                on_death();
            })?;

        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Default death action: leave immediately with status 1.
    ///
    /// No hooks run, nothing is drained and nothing is written to the parent.
    pub fn hard_exit() -> OnParentDeath {
        Box::new(|| {
            // SAFETY: _exit(2) only ends the process; no handlers or destructors run.
            unsafe { libc::_exit(1) }
        })
    }

    /// Whether the watch thread has already fired.
    pub fn has_fired(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the watch thread (only returns once the parent is gone).
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Block until the descriptor is readable or hung up.
fn wait_for_hangup(fd: &PipeFd) -> Result<()> {
    let interest = PollFlags::POLLIN | PollFlags::POLLHUP;
    loop {
        let mut fds = [PollFd::new(fd.as_fd(), interest)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(0) => continue,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                debug!(?revents, "Liveness pipe became ready");
                return Ok(());
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
