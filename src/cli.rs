//! Command-line interface definitions using clap.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use cluster_worker::WorkerConfig;
use cluster_worker::logging::LogFormat;

/// One worker of a pre-forking server cluster, started by the cluster parent.
#[derive(Parser, Debug)]
#[command(name = "cluster-worker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Worker index within the cluster (0 is generation zero).
    #[arg(long)]
    pub index: usize,

    /// Identifier of the parent, shown in the process title.
    #[arg(long)]
    pub master: String,

    /// Descriptor of the write end of the status pipe.
    #[arg(long, value_parser = parse_fd)]
    pub status_fd: RawFd,

    /// Descriptor of the read end of the parent-liveness pipe.
    #[arg(long, value_parser = parse_fd)]
    pub check_fd: RawFd,

    /// Descriptor of the read end of the fork-request pipe (worker 0 only).
    #[arg(long, value_parser = parse_fd)]
    pub fork_fd: Option<RawFd>,

    /// Descriptor used to wake the parent after siblings were reaped.
    #[arg(long, value_parser = parse_fd)]
    pub wakeup_fd: Option<RawFd>,

    /// Worker 0 forks its siblings on request.
    #[arg(long)]
    pub fork_worker: bool,

    /// Seconds between status lines.
    #[arg(long, value_parser = parse_interval)]
    pub check_interval: Option<Duration>,

    /// Tag appended to the process title.
    #[arg(long)]
    pub tag: Option<String>,

    /// Thread pool size reported by the built-in idle server.
    #[arg(long, env = "CLUSTER_WORKER_MAX_THREADS", default_value_t = 5)]
    pub max_threads: usize,

    /// Enable verbose logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format: pretty, compact or json.
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Also log to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Worker configuration: defaults, then environment, then flags.
    pub fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::new().with_env_overrides();
        if self.fork_worker {
            config = config.with_fork_worker(true);
        }
        if let Some(interval) = self.check_interval {
            config = config.with_check_interval(interval);
        }
        if let Some(ref tag) = self.tag {
            config = config.with_tag(tag.clone());
        }
        config
    }

    /// Every descriptor passed on the command line, with its flag name.
    pub fn descriptors(&self) -> Vec<(&'static str, RawFd)> {
        let mut fds = vec![("--status-fd", self.status_fd), ("--check-fd", self.check_fd)];
        if let Some(fd) = self.fork_fd {
            fds.push(("--fork-fd", fd));
        }
        if let Some(fd) = self.wakeup_fd {
            fds.push(("--wakeup-fd", fd));
        }
        fds
    }
}

fn parse_fd(s: &str) -> Result<RawFd, String> {
    let fd: RawFd = s
        .parse()
        .map_err(|_| format!("'{}' is not a file descriptor", s))?;
    if fd < 0 {
        return Err(format!("file descriptor must not be negative, got {}", fd));
    }
    Ok(fd)
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", s))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("interval must be positive, got {}", s));
    }
    Ok(Duration::from_secs_f64(secs))
}
