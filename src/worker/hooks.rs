//! Lifecycle hooks invoked by a worker.
//!
//! Hooks receive the worker's private [`HookData`] scratch map. A failing hook
//! is logged and does not stop the lifecycle step that triggered it.

use std::collections::HashMap;
use std::fmt;

use tracing::error;

use crate::error::WorkerError;

/// Per-worker scratch map shared by all hook invocations of that worker.
pub type HookData = HashMap<String, serde_json::Value>;

/// Error type returned by user hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Points in the worker lifecycle where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Before the server boots; receives the worker index.
    BeforeWorkerBoot,
    /// After the run loop exits, before the final `Term` message.
    BeforeWorkerShutdown,
    /// In generation zero, right before forking the sibling at the given index.
    BeforeWorkerFork,
    /// In generation zero, right after forking the sibling at the given index.
    AfterWorkerFork,
    /// In generation zero, after the running generation was told to drain.
    BeforeRefork,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeWorkerBoot => "before_worker_boot",
            Self::BeforeWorkerShutdown => "before_worker_shutdown",
            Self::BeforeWorkerFork => "before_worker_fork",
            Self::AfterWorkerFork => "after_worker_fork",
            Self::BeforeRefork => "before_refork",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of lifecycle hook calls.
pub trait Hooks: Send + Sync + 'static {
    /// Run every hook registered for `kind`.
    ///
    /// `index` is the worker index for boot/shutdown, the sibling index for
    /// fork hooks, and `None` for `BeforeRefork`.
    fn call(
        &self,
        kind: HookKind,
        index: Option<usize>,
        data: &mut HookData,
    ) -> Result<(), HookError>;
}

/// No hooks at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl Hooks for NoHooks {
    fn call(&self, _: HookKind, _: Option<usize>, _: &mut HookData) -> Result<(), HookError> {
        Ok(())
    }
}

type HookFn = Box<dyn Fn(Option<usize>, &mut HookData) -> Result<(), HookError> + Send + Sync>;

/// Registry of closures per [`HookKind`], run in registration order.
#[derive(Default)]
pub struct HookSet {
    hooks: HashMap<HookKind, Vec<HookFn>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook.
    pub fn on<F>(mut self, kind: HookKind, f: F) -> Self
    where
        F: Fn(Option<usize>, &mut HookData) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.hooks.entry(kind).or_default().push(Box::new(f));
        self
    }

    /// Number of hooks registered for `kind`.
    pub fn count(&self, kind: HookKind) -> usize {
        self.hooks.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .hooks
            .iter()
            .map(|(kind, hooks)| (kind.as_str(), hooks.len()))
            .collect();
        f.debug_struct("HookSet").field("hooks", &counts).finish()
    }
}

impl Hooks for HookSet {
    /// Runs every hook even if an earlier one fails; the first error is returned.
    fn call(
        &self,
        kind: HookKind,
        index: Option<usize>,
        data: &mut HookData,
    ) -> Result<(), HookError> {
        let mut first_error = None;
        for hook in self.hooks.get(&kind).into_iter().flatten() {
            if let Err(e) = hook(index, data) {
                error!(hook = %kind, error = %e, "Hook failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Invoke a hook and log instead of propagating its failure.
pub(crate) fn run_hook(
    hooks: &dyn Hooks,
    kind: HookKind,
    index: Option<usize>,
    data: &mut HookData,
) {
    if let Err(e) = hooks.call(kind, index, data) {
        let err = WorkerError::Hook {
            hook: kind.as_str(),
            message: e.to_string(),
        };
        error!(error = %err, "Continuing after hook failure");
    }
}
