//! Worker configuration.

use std::time::Duration;

/// Default interval between status lines.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Options that shape a worker's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Worker 0 forks its siblings instead of the parent doing it.
    pub fork_worker: bool,
    /// Interval between `p<pid>{...}` status lines.
    pub worker_check_interval: Duration,
    /// Appended to the process title as ` [tag]` when non-empty.
    pub tag: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fork_worker: false,
            worker_check_interval: DEFAULT_CHECK_INTERVAL,
            tag: None,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fork_worker(mut self, enabled: bool) -> Self {
        self.fork_worker = enabled;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.worker_check_interval = interval;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Apply `CLUSTER_WORKER_*` environment overrides.
    ///
    /// Reads:
    /// - `CLUSTER_WORKER_FORK_WORKER` (`1`/`true`/`yes` enables)
    /// - `CLUSTER_WORKER_CHECK_INTERVAL` in seconds
    /// - `CLUSTER_WORKER_TAG`
    ///
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("CLUSTER_WORKER_FORK_WORKER") {
            self.fork_worker = matches!(
                value.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        if let Ok(value) = std::env::var("CLUSTER_WORKER_CHECK_INTERVAL")
            && let Ok(secs) = value.trim().parse::<f64>()
            && secs.is_finite()
            && secs > 0.0
        {
            self.worker_check_interval = Duration::from_secs_f64(secs);
        }

        if let Ok(tag) = std::env::var("CLUSTER_WORKER_TAG") {
            self.tag = Some(tag);
        }

        self
    }

    /// Tag to show in the title, if any.
    pub fn display_tag(&self) -> Option<&str> {
        self.tag.as_deref().filter(|tag| !tag.is_empty())
    }

    /// Whether the worker at `index` is the generation-zero fork parent.
    pub fn is_fork_capable(&self, index: usize) -> bool {
        self.fork_worker && index == 0
    }
}
