//! Mutation-thread scheduling.
//!
//! Host state may only change on one designated thread. Other threads never
//! run work there directly; they queue a [`MutationTask`] and the host's
//! consumer loop executes it at the next opportunity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Work the sync engine asks the mutation thread to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationTask {
    /// Drain the inbound queue and apply every pending update.
    DispatchInbound,
    /// Diff registered send paths and publish changes.
    PollOutbound,
}

impl MutationTask {
    const COUNT: usize = 2;

    const fn index(self) -> usize {
        match self {
            MutationTask::DispatchInbound => 0,
            MutationTask::PollOutbound => 1,
        }
    }
}

/// Capability to run work on the host's mutation thread.
pub trait MainThreadScheduler: Send + Sync {
    /// Queue `task` to run once on the mutation thread.
    fn run_on_mutation_thread(&self, task: MutationTask);

    /// Queue `task` unless it is already pending. Returns `true` if this call queued it.
    fn arm_if_not_armed(&self, task: MutationTask) -> bool;
}

/// Task queue for hosts that run a cooperative main loop.
///
/// Producers on any thread call the [`MainThreadScheduler`] methods; the
/// mutation thread calls [`TaskQueue::drain`] and runs what it gets.
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: Mutex<VecDeque<MutationTask>>,
    armed: [AtomicBool; MutationTask::COUNT],
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every pending task in FIFO order.
    ///
    /// Armed flags are cleared before returning, so work arriving while the
    /// returned tasks run re-arms a fresh tick.
    pub fn drain(&self) -> Vec<MutationTask> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let tasks: Vec<MutationTask> = pending.drain(..).collect();
        drop(pending);
        for task in &tasks {
            self.armed[task.index()].store(false, Ordering::Release);
        }
        tasks
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, task: MutationTask) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
    }
}

impl MainThreadScheduler for TaskQueue {
    fn run_on_mutation_thread(&self, task: MutationTask) {
        self.push(task);
    }

    fn arm_if_not_armed(&self, task: MutationTask) -> bool {
        if self.armed[task.index()].swap(true, Ordering::AcqRel) {
            return false;
        }
        self.push(task);
        true
    }
}
