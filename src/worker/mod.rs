//! Per-worker supervisor for a pre-forking server cluster.
//!
//! A parent process forks N workers and talks to each over pipes. Each worker
//! boots the serving engine, reports to the parent, serves until told to stop,
//! and, as generation zero of a fork-worker cluster, forks its own siblings.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │      Parent process      │
//!                 └──┬─────────┬─────────┬───┘
//!      status pipe ▲ │ liveness│   fork  │ pipe (worker 0 only)
//!   b/f/t/e/p lines│ │ pipe    ▼         ▼
//!                 ┌┴─┴──────────────────────────────────────────┐
//!                 │ Worker                                      │
//!                 │  wrkr check ── parent gone ─► _exit(1)      │
//!                 │  wrkr signals ─ SIGTERM/SIGCHLD ─┐          │
//!                 │  wrkr fork ──── -1 / 0 / n ──────┼─► queue ─┼─► consume loop
//!                 │  stat pld ───── p<pid>{...}      │  (mutex) │     Restart / Spawn / Stopped
//!                 └──────────────────────────────────┴──────────┘
//! ```
//!
//! # Features
//!
//! - **Single lock**: every lifecycle mutation goes through one queue mutex
//! - **No signal-context work**: signals are received with `sigwait` on a thread
//! - **Phased refork**: generation zero forks siblings on request
//! - **Parent watch**: a worker never outlives its parent

mod broker;
mod hooks;
mod ipc;
mod process;
mod protocol;
mod queue;
mod server;
mod signals;
mod spawn;
mod status;
mod watchdog;

pub use broker::{ForkBroker, Handled};
pub use hooks::{HookData, HookError, HookKind, HookSet, Hooks, NoHooks};
pub use ipc::{IpcChannel, LineReader, PipeFd, pipe};
pub use process::{Worker, WorkerExit, WorkerPipes};
pub use protocol::{ForkRequest, IpcMessage, ServerStats, WorkerCommand, parse_status_line, status_line};
pub use queue::{CommandQueue, QueueState};
pub use server::{IdleServer, Server, ServerFactory};
pub use signals::{SignalRouter, TerminationReason, analyze_wait_status};
pub use spawn::{Forker, OsForker, WorkerFactory};
pub use status::StatusReporter;
pub use watchdog::{OnParentDeath, ParentWatch};
