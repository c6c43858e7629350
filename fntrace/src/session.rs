//! `Session`: a task's private route into the persistence pipeline.
//!
//! Every task gets exactly one `Session`, created lazily on its first
//! `Enter` and held in `SessionRegistry` until the task finalizes. A
//! `Session` owns that task's call-stack depth/parent-id bookkeeping
//! (behind a mutex, since a task can in principle be driven from more than
//! one concurrent `Enter` if a host misuses the API) and a bounded
//! outbound channel of ops, drained by a forwarder task started lazily on
//! the first `Enqueue`. Routing every write through this per-task channel
//! before it reaches the process-wide `PersistencePipeline` keeps one
//! slow/backed-up task from reordering another task's writes, and gives
//! `Close` a single place to wait for a task's in-flight writes to land.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::ids::IdGenerator;
use crate::pipeline::{Op, PersistencePipeline};

/// Bounded outbound channel capacity for a single task's Session.
const OUTBOUND_CAPACITY: usize = 50;

struct Stack {
    depth: usize,
    frames: HashMap<usize, i64>,
}

#[derive(Default)]
struct Forwarder {
    sender: Option<mpsc::Sender<Op>>,
    handle: Option<JoinHandle<()>>,
}

/// One task's call-stack state and its private route into the persistence
/// pipeline. Exactly one `Session` exists per live task id, held in
/// `SessionRegistry`.
pub struct Session {
    stack: Mutex<Stack>,
    forwarder: Mutex<Forwarder>,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
    trace_ids: Arc<IdGenerator>,
    pipeline: Arc<PersistencePipeline>,
    /// This task's `TaskRecord` row id, set once its first `Enter` saves
    /// the row. `None` until then.
    pub task_row_id: Mutex<Option<i64>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Instant,
}

impl Session {
    fn new(trace_ids: Arc<IdGenerator>, pipeline: Arc<PersistencePipeline>) -> Arc<Self> {
        Arc::new(Self {
            stack: Mutex::new(Stack { depth: 0, frames: HashMap::new() }),
            forwarder: Mutex::new(Forwarder::default()),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
            trace_ids,
            pipeline,
            task_row_id: Mutex::new(None),
            created_at: Utc::now(),
            started_at: Instant::now(),
        })
    }

    /// `PrepareEnter`: under the stack's mutex, reads the current depth and
    /// parent id, allocates a fresh trace id, and pushes it as the new
    /// innermost frame. Returns `(depth, parent_id, trace_id)`; `parent_id`
    /// is `0` at the root.
    pub fn prepare_enter(&self) -> (usize, i64, i64) {
        let mut s = self.stack.lock().unwrap();
        let depth = s.depth;
        let parent_id = if depth == 0 { 0 } else { *s.frames.get(&(depth - 1)).unwrap_or(&0) };
        let trace_id = self.trace_ids.next() as i64;
        s.frames.insert(depth, trace_id);
        s.depth += 1;
        (depth, parent_id, trace_id)
    }

    /// `OnExit`: pops the innermost frame. A no-op-but-reset if called on
    /// an already-empty stack, which can happen if `Exit` is called
    /// without a matching `Enter` (misuse, not a panic condition). Returns
    /// the depth the popped frame was at.
    pub fn on_exit(&self) -> usize {
        let mut s = self.stack.lock().unwrap();
        let depth = s.depth;
        if depth > 0 {
            s.frames.remove(&(depth - 1));
            s.depth -= 1;
        } else {
            s.depth = 0;
            s.frames.clear();
        }
        depth
    }

    /// Current call-stack depth; zero once a task has unwound back to its
    /// root.
    pub fn depth(&self) -> usize {
        self.stack.lock().unwrap().depth
    }

    /// `EnsureForwarder`: starts at most one forwarder task draining this
    /// session's outbound channel into the shared pipeline, lazily, on the
    /// first `Enqueue`.
    fn ensure_forwarder(self: &Arc<Self>) -> mpsc::Sender<Op> {
        let mut f = self.forwarder.lock().unwrap();
        if let Some(sender) = &f.sender {
            return sender.clone();
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        f.handle = Some(tokio::spawn(forward(rx, self.pipeline.clone())));
        f.sender = Some(tx.clone());
        tx
    }

    /// `Enqueue`: sends `op` on the bounded outbound channel, blocking the
    /// caller under back-pressure when it's full (spec: "Enqueue may block
    /// when a Session's outbound channel is full"). Once the session is
    /// closed, an op is handed straight to the pipeline instead, so a write
    /// already accepted for tracing is never dropped.
    pub async fn enqueue(self: &Arc<Self>, op: Op) {
        if self.closed.load(Ordering::SeqCst) {
            self.pipeline.submit(op).await;
            return;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let sender = self.ensure_forwarder();
        let send_result = sender.send(op).await;
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && self.closed.load(Ordering::SeqCst) {
            self.drained.notify_one();
        }
        if let Err(mpsc::error::SendError(op)) = send_result {
            self.pipeline.submit(op).await;
        }
    }

    /// `Close`: marks the session closed, waits for every `Enqueue`
    /// already past its closed-check to land on the channel, then drops
    /// the sender (closing the channel) and waits for the forwarder to
    /// drain it and exit. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            // Constructed before the in-flight check so a `notify_one`
            // racing us between the check and the await is never missed.
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        let (sender, handle) = {
            let mut f = self.forwarder.lock().unwrap();
            (f.sender.take(), f.handle.take())
        };
        drop(sender);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Drains one session's outbound channel into the shared pipeline until
/// the channel closes (i.e. `Session::close` dropped the sender).
async fn forward(mut rx: mpsc::Receiver<Op>, pipeline: Arc<PersistencePipeline>) {
    while let Some(op) = rx.recv().await {
        pipeline.submit(op).await;
    }
}

/// Maps task id -> `Session`, created lazily on a task's first `Enter`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `GetOrCreate`: returns the existing session for `task_id`, or
    /// lazily creates one. `DashMap::entry` holds the shard lock for the
    /// whole read-or-insert, giving the spec's double-checked-locking
    /// behavior without a separate explicit check.
    pub fn get_or_create(
        &self,
        task_id: u64,
        trace_ids: Arc<IdGenerator>,
        pipeline: Arc<PersistencePipeline>,
    ) -> Arc<Session> {
        self.sessions.entry(task_id).or_insert_with(|| Session::new(trace_ids, pipeline)).clone()
    }

    pub fn get(&self, task_id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&task_id).map(|e| e.clone())
    }

    pub fn contains(&self, task_id: u64) -> bool {
        self.sessions.contains_key(&task_id)
    }

    pub fn remove(&self, task_id: u64) -> Option<Arc<Session>> {
        self.sessions.remove(&task_id).map(|(_, v)| v)
    }

    /// Every task id currently registered, for diffing against the set of
    /// scopes/threads actually still alive.
    pub fn registered_task_ids(&self) -> Vec<u64> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InsertMode;
    use fntrace_store::{MethodKind, RepositoryFactory, SqliteFactory, TraceRecord};

    async fn test_session(mode: InsertMode) -> (Arc<Session>, Arc<dyn RepositoryFactory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let factory = SqliteFactory::initialize(dir.path().join("t.db")).await.unwrap();
        let repos: Arc<dyn RepositoryFactory> = Arc::new(factory);
        let pipeline = Arc::new(PersistencePipeline::new(repos.clone(), mode));
        let session = Session::new(Arc::new(IdGenerator::new()), pipeline);
        (session, repos, dir)
    }

    fn trace_record(id: i64, depth: i32, parent_id: i64) -> TraceRecord {
        TraceRecord {
            id,
            name: "demo.Compute".into(),
            task_id: 1,
            depth,
            param_count: 0,
            parent_id,
            created_at: chrono::Utc::now().to_rfc3339(),
            sequence: "0.00".into(),
            elapsed: String::new(),
            finished: false,
            method_kind: MethodKind::Plain,
        }
    }

    #[tokio::test]
    async fn prepare_enter_then_on_exit_tracks_depth_and_parent() {
        let (session, _repos, _dir) = test_session(InsertMode::Sync).await;

        let (d0, p0, t0) = session.prepare_enter();
        assert_eq!((d0, p0), (0, 0));

        let (d1, p1, _t1) = session.prepare_enter();
        assert_eq!(d1, 1);
        assert_eq!(p1, t0);

        assert_eq!(session.on_exit(), 1);
        assert_eq!(session.depth(), 1);
        assert_eq!(session.on_exit(), 0);
        assert_eq!(session.depth(), 0);
    }

    #[tokio::test]
    async fn on_exit_on_an_already_empty_stack_is_a_no_op() {
        let (session, _repos, _dir) = test_session(InsertMode::Sync).await;
        assert_eq!(session.on_exit(), 0);
        assert_eq!(session.depth(), 0);
    }

    #[tokio::test]
    async fn enqueue_lands_the_op_through_the_forwarder() {
        let (session, repos, _dir) = test_session(InsertMode::Async).await;
        session.enqueue(Op::SaveTrace(trace_record(1, 0, 0))).await;
        session.close().await;

        let roots = repos.trace_repository().find_root_functions_by_task(1).await.unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_close_goes_straight_to_the_pipeline() {
        let (session, repos, _dir) = test_session(InsertMode::Sync).await;
        session.close().await;
        session.enqueue(Op::SaveTrace(trace_record(2, 0, 0))).await;

        let roots = repos.trace_repository().find_root_functions_by_task(1).await.unwrap();
        assert!(roots.iter().any(|r| r.id == 2));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _repos, _dir) = test_session(InsertMode::Sync).await;
        session.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_session_for_the_same_task() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SqliteFactory::initialize(dir.path().join("t.db")).await.unwrap();
        let repos: Arc<dyn RepositoryFactory> = Arc::new(factory);
        let pipeline = Arc::new(PersistencePipeline::new(repos, InsertMode::Sync));
        let ids = Arc::new(IdGenerator::new());
        let registry = SessionRegistry::new();

        let a = registry.get_or_create(7, ids.clone(), pipeline.clone());
        a.prepare_enter();
        let b = registry.get_or_create(7, ids, pipeline);
        assert_eq!(b.depth(), 1, "must be the same session, not a fresh one");
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SqliteFactory::initialize(dir.path().join("t.db")).await.unwrap();
        let repos: Arc<dyn RepositoryFactory> = Arc::new(factory);
        let pipeline = Arc::new(PersistencePipeline::new(repos, InsertMode::Sync));
        let registry = SessionRegistry::new();

        registry.get_or_create(2, Arc::new(IdGenerator::new()), pipeline);
        assert!(registry.remove(2).is_some());
        assert!(!registry.contains(2));
    }
}
