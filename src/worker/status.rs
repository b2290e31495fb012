//! Periodic server statistics on the status pipe.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use super::ipc::IpcChannel;
use super::protocol::status_line;
use super::server::Server;
use crate::error::Result;

/// Background `stat pld` thread sending `p<pid>{...}` lines.
///
/// The loop ends quietly when the parent stops reading. Dropping the reporter
/// stops and joins the thread.
pub struct StatusReporter {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StatusReporter {
    pub fn spawn(
        ipc: IpcChannel,
        server: Arc<dyn Server>,
        interval: Duration,
        pid: i32,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name("stat pld".to_string())
            .spawn(move || report_loop(&ipc, server.as_ref(), interval, pid, &rx))?;

        Ok(Self {
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    /// Whether the reporting loop has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop reporting and wait for the thread.
    pub fn shutdown(&mut self) {
        // disconnecting wakes the sleeping loop
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StatusReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn report_loop(
    ipc: &IpcChannel,
    server: &dyn Server,
    interval: Duration,
    pid: i32,
    shutdown: &Receiver<()>,
) {
    loop {
        let line = match status_line(pid, &server.stats()) {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "Could not encode stats, stopping reporter");
                return;
            }
        };
        if let Err(e) = ipc.send_raw(&line) {
            debug!(error = %e, "Status channel gone, stopping reporter");
            return;
        }

        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ipc::{LineReader, pipe};
    use crate::worker::protocol::parse_status_line;
    use crate::worker::server::IdleServer;

    #[test]
    fn test_reports_periodically() {
        let (read_fd, write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);
        let server = IdleServer::arc(4);

        let mut reporter = StatusReporter::spawn(
            IpcChannel::new(write_fd),
            server,
            Duration::from_millis(10),
            31,
        )
        .unwrap();

        for _ in 0..3 {
            let line = reader.read_line_owned().unwrap().unwrap();
            let (pid, stats) = parse_status_line(&line).unwrap();
            assert_eq!(pid, 31);
            assert_eq!(stats.max_threads, 4);
        }

        reporter.shutdown();
        assert!(reporter.is_finished());
    }

    #[test]
    fn test_shutdown_is_prompt_with_long_interval() {
        let (_read_fd, write_fd) = pipe().unwrap();
        let reporter = StatusReporter::spawn(
            IpcChannel::new(write_fd),
            IdleServer::arc(1),
            Duration::from_secs(3600),
            1,
        )
        .unwrap();

        let started = std::time::Instant::now();
        drop(reporter);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_ends_when_channel_closed() {
        let (_read_fd, write_fd) = pipe().unwrap();
        let ipc = IpcChannel::new(write_fd);
        ipc.close();

        let reporter =
            StatusReporter::spawn(ipc, IdleServer::arc(1), Duration::from_millis(5), 1).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !reporter.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(reporter.is_finished());
    }
}
