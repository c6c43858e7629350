//! Task identity bookkeeping.
//!
//! Identity lives in a `tokio::task_local!` for any call chain running
//! inside [`scope`]: task-local values travel with a logical task across
//! await points, so a task resumed on a different worker thread after
//! suspension still reports the same id. Call-stack depth and the
//! parent-trace-id stack are *not* kept here — they live per task in
//! [`crate::session::Session`], which is looked up by the id this module
//! hands out.
//!
//! Anything that never runs inside `scope()` (a bare OS thread, or async
//! code a host never wrapped) falls back to a `thread_local!` keyed by the
//! running OS thread.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use once_cell::sync::Lazy;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Task ids currently tracked, either by an active `scope()` future or a
/// live OS thread that has touched the fallback. An entry is removed by
/// `TaskState`'s `Drop` impl: at scope-future-drop time for a tracked async
/// task, at thread-exit time for the thread-local fallback. The lifecycle
/// monitor diffs this set against `SessionRegistry` to find tasks that went
/// away without a matching `Exit`.
static LIVE_TASKS: Lazy<DashSet<u64>> = Lazy::new(DashSet::new);

pub fn live_task_ids() -> Vec<u64> {
    LIVE_TASKS.iter().map(|id| *id).collect()
}

struct TaskState {
    task_id: u64,
    create_time: chrono::DateTime<chrono::Utc>,
}

impl TaskState {
    fn new() -> Self {
        let task_id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_TASKS.insert(task_id);
        Self { task_id, create_time: chrono::Utc::now() }
    }
}

impl Drop for TaskState {
    fn drop(&mut self) {
        LIVE_TASKS.remove(&self.task_id);
    }
}

tokio::task_local! {
    static TASK_STATE: RefCell<TaskState>;
}

thread_local! {
    static THREAD_FALLBACK: RefCell<TaskState> = RefCell::new(TaskState::new());
}

fn with_state<R>(f: impl FnOnce(&TaskState) -> R) -> R {
    match TASK_STATE.try_with(|s| f(&s.borrow())) {
        Ok(r) => r,
        Err(_) => THREAD_FALLBACK.with(|s| f(&s.borrow())),
    }
}

/// Runs `fut` inside a fresh task-local scope, giving every `Enter`/`Exit`
/// call within it one stable task identity for the scope's lifetime, even
/// across await points that resume on a different OS worker thread. A host
/// should wrap the top-level future of each logical unit of work it wants
/// traced as its own task — typically its `main` body, and the body of
/// every `tokio::spawn` it wants tracked independently.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    TASK_STATE.scope(RefCell::new(TaskState::new()), fut).await
}

/// Convenience combining [`scope`] with `tokio::spawn`.
pub fn spawn_traced<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(scope(fut))
}

/// The id of the calling task, stable for the enclosing `scope()`'s
/// lifetime (or, absent one, for the calling thread's lifetime).
pub fn current_task_id() -> u64 {
    with_state(|s| s.task_id)
}

pub fn current_task_create_time() -> chrono::DateTime<chrono::Utc> {
    with_state(|s| s.create_time)
}
