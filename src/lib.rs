//! cluster-worker: per-worker supervisor for pre-forking server clusters.

pub mod config;
pub mod error;
pub mod logging;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use worker::{Worker, WorkerExit, WorkerPipes};
