//! Pipe primitives for worker ↔ parent communication.
//!
//! The status channel is shared by several writer threads (consume loop,
//! status reporter, signal thread). Every line goes out through a single
//! `write(2)` loop, relying on pipe writes below `PIPE_BUF` being atomic.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, PoisonError, RwLock};

use nix::fcntl::OFlag;

use super::protocol::IpcMessage;

/// Default buffer size for reading control lines.
const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create from a raw file descriptor (takes ownership).
    ///
    /// # Safety
    /// The caller must ensure `fd` is a valid, open descriptor that nothing else owns.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    /// Duplicate the descriptor (close-on-exec).
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self::new(self.fd.try_clone()?))
    }

    /// Write the whole buffer, retrying on EINTR and short writes.
    fn write_fully(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match nix::unistd::write(&self.fd, buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
        Ok(())
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Create a pipe whose both ends are close-on-exec.
///
/// Returns `(read_end, write_end)`.
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read_fd, write_fd) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok((PipeFd::new(read_fd), PipeFd::new(write_fd)))
}

/// Buffered line reader for the control pipes.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line_buffer: String,
}

impl LineReader {
    /// Create a new line reader from a file descriptor.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd),
            line_buffer: String::with_capacity(64),
        }
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        match self.reader.read_line(&mut self.line_buffer) {
            Ok(0) => Ok(None),
            Ok(_) => {
                if self.line_buffer.ends_with('\n') {
                    self.line_buffer.pop();
                }
                if self.line_buffer.ends_with('\r') {
                    self.line_buffer.pop();
                }
                Ok(Some(&self.line_buffer))
            }
            Err(e) => Err(e),
        }
    }

    /// Read a line and return an owned string.
    /// Returns `None` on EOF.
    pub fn read_line_owned(&mut self) -> io::Result<Option<String>> {
        Ok(self.read_line()?.map(String::from))
    }
}

/// Write end of the worker → parent status pipe.
///
/// Cheap to clone; all clones share one descriptor. After [`IpcChannel::close`]
/// every send fails with `BrokenPipe`.
#[derive(Clone, Debug)]
pub struct IpcChannel {
    fd: Arc<RwLock<Option<PipeFd>>>,
}

impl IpcChannel {
    /// Wrap the write end of a pipe.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            fd: Arc::new(RwLock::new(Some(fd))),
        }
    }

    /// Send one protocol message.
    pub fn send(&self, message: &IpcMessage) -> io::Result<()> {
        self.send_raw(&message.to_line())
    }

    /// Send a pre-formatted line; a trailing newline is added if missing.
    pub fn send_raw(&self, line: &str) -> io::Result<()> {
        let guard = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        let fd = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))?;

        if line.ends_with('\n') {
            fd.write_fully(line.as_bytes())
        } else {
            let mut owned = String::with_capacity(line.len() + 1);
            owned.push_str(line);
            owned.push('\n');
            fd.write_fully(owned.as_bytes())
        }
    }

    /// Independent channel on a duplicate of the descriptor.
    ///
    /// The copy shares no lock with `self`, so it stays usable in a forked
    /// child even if another thread held this channel during the fork.
    pub fn try_duplicate(&self) -> io::Result<Self> {
        let guard = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        let fd = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))?;
        Ok(Self::new(fd.try_clone()?))
    }

    /// Close the descriptor. Idempotent.
    pub fn close(&self) {
        let mut guard = self.fd.write().unwrap_or_else(PoisonError::into_inner);
        guard.take();
    }

    /// Whether [`IpcChannel::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.fd
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_reader_roundtrip() {
        let (read_fd, mut write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);

        write_fd.write_all(b"5\n-1\r\n\n").unwrap();
        drop(write_fd);

        assert_eq!(reader.read_line().unwrap(), Some("5"));
        assert_eq!(reader.read_line().unwrap(), Some("-1"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_line_reader_owned() {
        let (read_fd, mut write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);

        write_fd.write_all(b"0\n").unwrap();
        drop(write_fd);

        assert_eq!(reader.read_line_owned().unwrap(), Some("0".to_string()));
    }

    #[test]
    fn test_try_clone_keeps_pipe_open() {
        let (read_fd, write_fd) = pipe().unwrap();
        let mut dup = write_fd.try_clone().unwrap();
        assert_ne!(dup.as_raw_fd(), write_fd.as_raw_fd());
        drop(write_fd);

        dup.write_all(b"still here\n").unwrap();
        drop(dup);

        let mut reader = LineReader::new(read_fd);
        assert_eq!(reader.read_line().unwrap(), Some("still here"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_channel_send_appends_newline() {
        let (read_fd, write_fd) = pipe().unwrap();
        let channel = IpcChannel::new(write_fd);
        let mut reader = LineReader::new(read_fd);

        channel.send(&IpcMessage::Term { pid: 42 }).unwrap();
        channel.send_raw("p42{}").unwrap();
        channel.close();

        assert_eq!(reader.read_line().unwrap(), Some("t42"));
        assert_eq!(reader.read_line().unwrap(), Some("p42{}"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_send_after_close_is_broken_pipe() {
        let (_read_fd, write_fd) = pipe().unwrap();
        let channel = IpcChannel::new(write_fd);
        let clone = channel.clone();

        channel.close();
        assert!(clone.is_closed());
        let err = clone.send(&IpcMessage::Term { pid: 1 }).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        // closing twice is harmless
        channel.close();
    }

    #[test]
    fn test_duplicate_outlives_close() {
        let (read_fd, write_fd) = pipe().unwrap();
        let channel = IpcChannel::new(write_fd);
        let dup = channel.try_duplicate().unwrap();
        let mut reader = LineReader::new(read_fd);

        channel.close();
        assert!(channel.try_duplicate().is_err());
        dup.send(&IpcMessage::Fork { pid: 9, index: 2 }).unwrap();
        dup.close();

        assert_eq!(reader.read_line().unwrap(), Some("f9:2"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_send_to_vanished_reader_fails() {
        let (read_fd, write_fd) = pipe().unwrap();
        let channel = IpcChannel::new(write_fd);
        drop(read_fd);

        // SIGPIPE is ignored by the Rust runtime, so this surfaces as EPIPE.
        assert!(channel.send(&IpcMessage::Boot { pid: 1, index: 0 }).is_err());
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave_lines() {
        let (read_fd, write_fd) = pipe().unwrap();
        let channel = IpcChannel::new(write_fd);
        let mut reader = LineReader::new(read_fd);

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let ch = channel.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        ch.send(&IpcMessage::Boot { pid: 1000 + n, index: n as usize })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        channel.close();

        let mut count = 0;
        while let Some(line) = reader.read_line().unwrap() {
            assert!(IpcMessage::from_line(line).is_ok(), "torn line: {line:?}");
            count += 1;
        }
        assert_eq!(count, 200);
    }
}
