//! Wire formats spoken between a worker and its parent.
//!
//! Worker → parent (status pipe), one newline-terminated line per message:
//!
//! ```text
//! b<pid>:<index>   worker booted
//! f<pid>:<index>   generation-zero worker forked a sibling
//! t<pid>           worker terminated
//! e<pid>           worker received an external SIGTERM
//! p<pid>{...}      periodic server statistics (JSON object)
//! ```
//!
//! Parent → generation-zero worker (fork pipe): newline-terminated integers,
//! `-1` (stop the current generation), `0` (restart in place), `n > 0`
//! (spawn a sibling at index `n`).

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

/// Message written by a worker on the status pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcMessage {
    Boot { pid: i32, index: usize },
    Fork { pid: i32, index: usize },
    Term { pid: i32 },
    ExternalTerm { pid: i32 },
}

impl IpcMessage {
    /// One-character tag that starts the wire line.
    pub fn tag(&self) -> char {
        match self {
            Self::Boot { .. } => 'b',
            Self::Fork { .. } => 'f',
            Self::Term { .. } => 't',
            Self::ExternalTerm { .. } => 'e',
        }
    }

    /// Serialize to the wire line (with newline).
    pub fn to_line(&self) -> String {
        match self {
            Self::Boot { pid, index } | Self::Fork { pid, index } => {
                format!("{}{}:{}\n", self.tag(), pid, index)
            }
            Self::Term { pid } | Self::ExternalTerm { pid } => format!("{}{}\n", self.tag(), pid),
        }
    }

    /// Parse a wire line. Trailing whitespace is ignored.
    pub fn from_line(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let invalid = || WorkerError::InvalidMessage(line.to_string());

        let mut chars = line.chars();
        let tag = chars.next().ok_or_else(invalid)?;
        let body = chars.as_str();

        let pid_and_index = || -> Result<(i32, usize)> {
            let (pid, index) = body.split_once(':').ok_or_else(invalid)?;
            Ok((
                pid.parse().map_err(|_| invalid())?,
                index.parse().map_err(|_| invalid())?,
            ))
        };
        let pid_only = || -> Result<i32> { body.parse().map_err(|_| invalid()) };

        match tag {
            'b' => pid_and_index().map(|(pid, index)| Self::Boot { pid, index }),
            'f' => pid_and_index().map(|(pid, index)| Self::Fork { pid, index }),
            't' => pid_only().map(|pid| Self::Term { pid }),
            'e' => pid_only().map(|pid| Self::ExternalTerm { pid }),
            _ => Err(invalid()),
        }
    }
}

/// Snapshot of serving-engine metrics reported on the status pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub backlog: usize,
    pub running: usize,
    pub pool_capacity: usize,
    pub max_threads: usize,
    pub requests_count: u64,
}

/// Format a status line: `p<pid>` followed by the stats as a JSON object.
pub fn status_line(pid: i32, stats: &ServerStats) -> Result<String> {
    let mut line = format!("p{pid}");
    line.push_str(&serde_json::to_string(stats)?);
    line.push('\n');
    Ok(line)
}

/// Parse a status line back into its pid and stats.
pub fn parse_status_line(line: &str) -> Result<(i32, ServerStats)> {
    let invalid = || WorkerError::InvalidMessage(line.to_string());
    let body = line.trim_end().strip_prefix('p').ok_or_else(invalid)?;
    let brace = body.find('{').ok_or_else(invalid)?;
    let pid = body[..brace].parse().map_err(|_| invalid())?;
    let stats = serde_json::from_str(&body[brace..])?;
    Ok((pid, stats))
}

/// Request read by the generation-zero worker from the fork pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRequest {
    /// `-1`: stop the running generation ahead of a refork.
    Stop,
    /// `0`: start a new generation in this process.
    Restart,
    /// `n > 0`: fork a sibling worker at index `n`.
    Spawn(usize),
}

impl ForkRequest {
    /// Parse one control line. Anything but `-1`, `0` or a positive index is rejected.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let value: i64 = trimmed
            .parse()
            .map_err(|_| WorkerError::InvalidForkRequest(trimmed.to_string()))?;

        match value {
            -1 => Ok(Self::Stop),
            0 => Ok(Self::Restart),
            n if n > 0 => usize::try_from(n)
                .map(Self::Spawn)
                .map_err(|_| WorkerError::InvalidForkRequest(trimmed.to_string())),
            _ => Err(WorkerError::InvalidForkRequest(trimmed.to_string())),
        }
    }

    /// Wire form (without newline).
    pub fn to_wire(&self) -> String {
        match self {
            Self::Stop => "-1".to_string(),
            Self::Restart => "0".to_string(),
            Self::Spawn(n) => n.to_string(),
        }
    }
}

/// Lifecycle command consumed by the worker's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Start a new server generation and wait for it to finish.
    Restart,
    /// Terminal entry: the run loop exits when it pops this.
    Stopped,
    /// Fork a sibling at the given index (generation-zero only).
    Spawn(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_message_wire_format() {
        assert_eq!(IpcMessage::Boot { pid: 100, index: 0 }.to_line(), "b100:0\n");
        assert_eq!(IpcMessage::Fork { pid: 205, index: 3 }.to_line(), "f205:3\n");
        assert_eq!(IpcMessage::Term { pid: 100 }.to_line(), "t100\n");
        assert_eq!(IpcMessage::ExternalTerm { pid: 100 }.to_line(), "e100\n");
    }

    #[test]
    fn test_message_parse() {
        assert_eq!(
            IpcMessage::from_line("f205:3\n").unwrap(),
            IpcMessage::Fork { pid: 205, index: 3 }
        );
        assert_eq!(
            IpcMessage::from_line("e17").unwrap(),
            IpcMessage::ExternalTerm { pid: 17 }
        );
        assert!(IpcMessage::from_line("").is_err());
        assert!(IpcMessage::from_line("x12").is_err());
        assert!(IpcMessage::from_line("b12").is_err());
        assert!(IpcMessage::from_line("t12:3").is_err());
    }

    #[test]
    fn test_status_line() {
        let stats = ServerStats {
            backlog: 1,
            running: 2,
            pool_capacity: 3,
            max_threads: 5,
            requests_count: 8,
        };
        let line = status_line(77, &stats).unwrap();
        assert!(line.starts_with("p77{"));
        assert!(line.ends_with("}\n"));
        assert!(line.contains("\"pool_capacity\":3"));
        assert!(line.contains("\"requests_count\":8"));

        let (pid, parsed) = parse_status_line(&line).unwrap();
        assert_eq!(pid, 77);
        assert_eq!(parsed, stats);
    }

    #[test]
    fn test_parse_status_line_rejects_messages() {
        assert!(parse_status_line("b1:0").is_err());
        assert!(parse_status_line("p12").is_err());
    }

    #[test]
    fn test_fork_request_parse() {
        assert_eq!(ForkRequest::parse("-1\n").unwrap(), ForkRequest::Stop);
        assert_eq!(ForkRequest::parse("0").unwrap(), ForkRequest::Restart);
        assert_eq!(ForkRequest::parse(" 5 ").unwrap(), ForkRequest::Spawn(5));
        assert!(ForkRequest::parse("-2").is_err());
        assert!(ForkRequest::parse("five").is_err());
        assert!(ForkRequest::parse("").is_err());
        assert!(ForkRequest::parse("99999999999999999999999").is_err());
    }

    proptest! {
        #[test]
        fn fork_request_parse_never_panics(line in "\\PC*") {
            let _ = ForkRequest::parse(&line);
        }

        #[test]
        fn fork_request_accepts_every_positive_index(n in 1usize..1_000_000) {
            prop_assert_eq!(ForkRequest::parse(&format!("{n}\n")).unwrap(), ForkRequest::Spawn(n));
        }

        #[test]
        fn fork_request_rejects_below_minus_one(n in i64::MIN..-1) {
            prop_assert!(ForkRequest::parse(&n.to_string()).is_err());
        }
    }
}
