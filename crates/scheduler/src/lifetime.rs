//! Liveness guard shared between a query fragment and scan workers.
//!
//! The fragment owns the only strong handle to its [`TaskExecutionContext`].
//! Everything else holds a [`LivenessHandle`] and must successfully
//! [`acquire`](LivenessHandle::acquire) a [`TaskExecGuard`] before touching
//! fragment state. A failed acquire means the fragment is gone; callers
//! return quietly.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use uuid::Uuid;

/// Per-fragment execution state whose lifetime bounds all scan work.
#[derive(Debug)]
pub struct TaskExecutionContext {
    query_id: Uuid,
    fragment_id: u32,
}

impl TaskExecutionContext {
    pub fn new(query_id: Uuid, fragment_id: u32) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            fragment_id,
        })
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn fragment_id(&self) -> u32 {
        self.fragment_id
    }

    /// Non-owning handle for schedulers and workers.
    pub fn handle(self: &Arc<Self>) -> LivenessHandle {
        LivenessHandle(Arc::downgrade(self))
    }
}

/// Weak reference to a fragment's [`TaskExecutionContext`].
#[derive(Debug, Clone)]
pub struct LivenessHandle(Weak<TaskExecutionContext>);

impl LivenessHandle {
    /// A handle that never acquires. Useful for contexts built after teardown.
    pub fn dangling() -> Self {
        LivenessHandle(Weak::new())
    }

    /// Try to pin the fragment for the duration of the returned guard.
    /// Never blocks.
    pub fn acquire(&self) -> Option<TaskExecGuard> {
        self.0.upgrade().map(TaskExecGuard)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Proof that the fragment stays alive while this value is held.
#[derive(Debug)]
pub struct TaskExecGuard(Arc<TaskExecutionContext>);

impl Deref for TaskExecGuard {
    type Target = TaskExecutionContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
