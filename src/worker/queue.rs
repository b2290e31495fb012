//! Strictly ordered lifecycle command queue.
//!
//! One mutex guards the pending commands, the tracked child pids and the
//! generation flags. The consume loop, the signal thread and the fork broker
//! all mutate through it, so a termination request can never interleave with
//! a half-finished restart.
//!
//! ```text
//! ForkBroker ──push(Spawn/Restart)──┐
//! SignalRouter ──clear+push(Stopped)┼──► Mutex<QueueState> ──pop()──► consume loop
//! SIGCHLD reaper ──retain_children──┘        (+ Condvar)
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use nix::unistd::Pid;
use tracing::debug;

use super::protocol::WorkerCommand;

/// State protected by the queue mutex.
#[derive(Debug, Default)]
pub struct QueueState {
    commands: VecDeque<WorkerCommand>,
    children: HashSet<Pid>,
    /// A server generation was requested and has not been stopped by a refork yet.
    generation_armed: bool,
    /// SIGTERM was observed; the queue only drains towards `Stopped` now.
    terminating: bool,
}

impl QueueState {
    /// Append a command. Dropped once termination has begun.
    pub fn push(&mut self, command: WorkerCommand) -> bool {
        if self.terminating {
            debug!(?command, "Dropping command queued after termination");
            return false;
        }
        self.commands.push_back(command);
        true
    }

    /// Remove every pending command.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Pending commands, front first.
    pub fn commands(&self) -> impl Iterator<Item = &WorkerCommand> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn pop_front(&mut self) -> Option<WorkerCommand> {
        self.commands.pop_front()
    }

    /// Record a forked child.
    pub fn track_child(&mut self, pid: Pid) {
        self.children.insert(pid);
    }

    /// Children that have not been reaped yet.
    pub fn children(&self) -> impl Iterator<Item = &Pid> {
        self.children.iter()
    }

    /// Keep only the children for which `keep` returns true; returns how many were dropped.
    pub fn retain_children(&mut self, mut keep: impl FnMut(Pid) -> bool) -> usize {
        let before = self.children.len();
        self.children.retain(|pid| keep(*pid));
        before - self.children.len()
    }

    /// Mark that a generation has been requested.
    pub fn arm_generation(&mut self) {
        self.generation_armed = true;
    }

    /// Clear the armed flag, returning whether it was set.
    pub fn take_armed_generation(&mut self) -> bool {
        std::mem::take(&mut self.generation_armed)
    }

    pub fn is_generation_armed(&self) -> bool {
        self.generation_armed
    }

    /// Commit to stopping: clear everything pending and queue the terminal `Stopped`.
    pub fn begin_termination(&mut self) {
        self.commands.clear();
        self.commands.push_back(WorkerCommand::Stopped);
        self.generation_armed = false;
        self.terminating = true;
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }
}

/// Thread-safe FIFO of [`WorkerCommand`]s with a blocking pop.
#[derive(Debug, Default)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl CommandQueue {
    /// Create a queue pre-filled with `initial`.
    pub fn new(initial: impl IntoIterator<Item = WorkerCommand>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                commands: initial.into_iter().collect(),
                ..QueueState::default()
            }),
            available: Condvar::new(),
        }
    }

    /// Queue for a worker: `[Restart, Stopped]`, or empty for the fork-capable worker
    /// which waits for the parent's requests instead.
    pub fn for_worker(fork_capable: bool) -> Self {
        if fork_capable {
            Self::new([])
        } else {
            Self::new([WorkerCommand::Restart, WorkerCommand::Stopped])
        }
    }

    /// Lock the state without waiting for a command.
    pub fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock, mutate, and wake the consumer.
    pub fn update<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let result = {
            let mut state = self.lock();
            f(&mut state)
        };
        self.available.notify_all();
        result
    }

    /// Append a command.
    pub fn push(&self, command: WorkerCommand) -> bool {
        self.update(|state| state.push(command))
    }

    /// Append several commands atomically.
    pub fn extend(&self, commands: impl IntoIterator<Item = WorkerCommand>) {
        self.update(|state| {
            for command in commands {
                state.push(command);
            }
        });
    }

    /// Block until a command is available and pop it.
    ///
    /// The lock stays held in the returned guard, so the caller acts on the
    /// command inside the same critical section.
    pub fn pop(&self) -> (WorkerCommand, MutexGuard<'_, QueueState>) {
        let mut state = self.lock();
        loop {
            if let Some(command) = state.pop_front() {
                return (command, state);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Copy of the pending commands.
    pub fn snapshot(&self) -> Vec<WorkerCommand> {
        self.lock().commands().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_seeded_queue() {
        let queue = CommandQueue::for_worker(false);
        assert_eq!(
            queue.snapshot(),
            vec![WorkerCommand::Restart, WorkerCommand::Stopped]
        );
        assert!(CommandQueue::for_worker(true).is_empty());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(CommandQueue::for_worker(true));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let (command, _guard) = queue.pop();
                command
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        queue.push(WorkerCommand::Spawn(2));
        assert_eq!(consumer.join().unwrap(), WorkerCommand::Spawn(2));
    }

    #[test]
    fn test_termination_drops_later_pushes() {
        let queue = CommandQueue::new([WorkerCommand::Spawn(1), WorkerCommand::Restart]);
        queue.update(|state| state.begin_termination());

        assert!(!queue.push(WorkerCommand::Restart));
        queue.extend([WorkerCommand::Spawn(4)]);
        assert_eq!(queue.snapshot(), vec![WorkerCommand::Stopped]);
        assert!(queue.lock().is_terminating());
    }

    #[test]
    fn test_generation_flag() {
        let queue = CommandQueue::for_worker(true);
        assert!(!queue.update(|state| state.take_armed_generation()));

        queue.update(|state| state.arm_generation());
        assert!(queue.lock().is_generation_armed());
        assert!(queue.update(|state| state.take_armed_generation()));
        assert!(!queue.lock().is_generation_armed());
    }

    #[test]
    fn test_children_tracking() {
        let queue = CommandQueue::for_worker(true);
        queue.update(|state| {
            state.track_child(Pid::from_raw(10));
            state.track_child(Pid::from_raw(11));
        });

        let dropped = queue.update(|state| state.retain_children(|pid| pid.as_raw() != 10));
        assert_eq!(dropped, 1);
        let remaining: Vec<Pid> = queue.lock().children().copied().collect();
        assert_eq!(remaining, vec![Pid::from_raw(11)]);
    }

    fn command_strategy() -> impl Strategy<Value = WorkerCommand> {
        prop_oneof![
            Just(WorkerCommand::Restart),
            Just(WorkerCommand::Stopped),
            (1usize..64).prop_map(WorkerCommand::Spawn),
        ]
    }

    proptest! {
        #[test]
        fn pops_in_push_order(commands in proptest::collection::vec(command_strategy(), 0..32)) {
            let queue = CommandQueue::for_worker(true);
            for command in &commands {
                queue.push(*command);
            }

            let mut popped = Vec::with_capacity(commands.len());
            for _ in 0..commands.len() {
                let (command, _guard) = queue.pop();
                popped.push(command);
            }
            prop_assert_eq!(popped, commands);
            prop_assert!(queue.is_empty());
        }
    }
}
