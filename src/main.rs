//! cluster-worker - one worker of a pre-forking server cluster

mod cli;

use std::collections::HashSet;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nix::fcntl::{FcntlArg, fcntl};

use cli::Cli;
use cluster_worker::logging::{self, LogConfig};
use cluster_worker::worker::{IdleServer, IpcChannel, PipeFd, Server, ServerFactory};
use cluster_worker::{Worker, WorkerError, WorkerExit, WorkerPipes};

/// Parses arguments, sets up logging, then runs the worker and exits with its status.
///
/// Setup errors are printed with their cause chain and exit with status 1.
fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli) {
        Ok(exit) => exit.terminate(),
        Err(e) => {
            eprintln!("error: {}", e);
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::for_worker()
        .with_verbosity(cli.verbose)
        .with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(ref path) = cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init_with_file(config);
}

fn run(cli: &Cli) -> Result<WorkerExit> {
    let mut seen = HashSet::new();
    for (flag, fd) in cli.descriptors() {
        if !seen.insert(fd) {
            bail!("{} {} is already used by another option", flag, fd);
        }
        validate_fd(fd).with_context(|| format!("{} {} is not usable", flag, fd))?;
    }

    let status = adopt(cli.status_fd);
    let check = adopt(cli.check_fd);
    let max_threads = cli.max_threads;
    let factory: Arc<dyn ServerFactory> =
        Arc::new(move || -> cluster_worker::Result<Arc<dyn Server>> {
            Ok(IdleServer::arc(max_threads))
        });

    let pipes = WorkerPipes {
        status: IpcChannel::new(status),
        check: Some(check),
    };
    let mut worker = Worker::new(
        cli.index,
        cli.master.clone(),
        pipes,
        cli.worker_config(),
        factory,
    );
    if let Some(fd) = cli.fork_fd {
        worker = worker.with_fork_pipe(adopt(fd));
    }
    if let Some(fd) = cli.wakeup_fd {
        worker = worker.with_wakeup(IpcChannel::new(adopt(fd)));
    }

    Ok(worker.run())
}

/// Check that `fd` is an open descriptor.
fn validate_fd(fd: RawFd) -> cluster_worker::Result<()> {
    // SAFETY: the borrow only lives for this fcntl call, which reports EBADF
    // for a closed descriptor instead of touching it.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    fcntl(borrowed, FcntlArg::F_GETFD)
        .map(|_| ())
        .map_err(|source| WorkerError::BadDescriptor { fd, source })
}

/// Take ownership of a descriptor inherited from the parent.
fn adopt(fd: RawFd) -> PipeFd {
    // SAFETY: validated as open and distinct in `run`; nothing else in this
    // process owns descriptors handed over on the command line.
    unsafe { PipeFd::from_raw(fd) }
}
