//! Delivers trace/task/param writes to the backing store, either inline on
//! the caller's task (`InsertMode::Sync`) or through a bounded channel
//! drained by a pool of background workers (`InsertMode::Async`).
//!
//! The async path never drops a write. A full channel falls back to
//! executing the write inline on the caller instead of blocking on
//! `send().await` or discarding it: a momentarily slow consumer turns into
//! momentarily synchronous tracing rather than lost data. Because an
//! insert and its later update can end up on different paths (one inline,
//! one queued), a `pending` set of in-flight trace/task ids is used to make
//! every update wait for its insert to actually land, regardless of which
//! path either one took.
//!
//! This is the process-wide tier of the persistence pipeline. Each task's
//! [`crate::session::Session`] queues its own ops through a per-task
//! bounded channel and forwarder first, handing them to
//! [`PersistencePipeline::submit`] only once they reach the front of that
//! queue.

use std::sync::Arc;

use dashmap::DashMap;
use fntrace_store::{ParamCache, ParamRecord, RepositoryFactory, TaskRecord, TraceRecord};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::InsertMode;

/// Spec §4.8 default bounded-channel capacity.
const CHANNEL_CAPACITY: usize = 50;
/// Spec §4.8: "a worker pool (up to 50 workers) drains the channel".
const WORKER_COUNT: usize = 50;

// `SaveTask` and `SaveParamCache` are deliberately absent from this enum:
// both need their DB-assigned row id back before `Enter` can return (to
// register the task in `SessionRegistry`, or the snapshot in `TtlCache`),
// so the pipeline always runs them inline regardless of `InsertMode` — see
// `save_task`/`save_param_cache` below. Only writes that already carry a
// pre-assigned id (`TraceRecord`, `ParamRecord`) or that have nothing to
// hand back (the `Update*` variants) are eligible for the fire-and-forget
// path.
pub(crate) enum Op {
    SaveTrace(TraceRecord),
    UpdateTrace { id: i64, elapsed: String },
    UpdateTask { id: i64, elapsed: String, finished: bool },
    SaveParam(ParamRecord),
}

impl Op {
    fn pending_key(&self) -> Option<String> {
        match self {
            Op::SaveTrace(r) => Some(format!("trace:{}", r.id)),
            Op::UpdateTrace { id, .. } => Some(format!("trace:{id}")),
            _ => None,
        }
    }

    fn is_insert(&self) -> bool {
        matches!(self, Op::SaveTrace(_))
    }
}

pub struct PersistencePipeline {
    repos: Arc<dyn RepositoryFactory>,
    mode: InsertMode,
    sender: Mutex<Option<mpsc::Sender<Op>>>,
    pending: Arc<DashMap<String, Arc<Notify>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistencePipeline {
    /// Builds the pipeline. In `Async` mode this also spawns the worker
    /// pool that drains the channel; the returned handle must be kept
    /// alive (and `close`d) for those workers to ever run.
    pub fn new(repos: Arc<dyn RepositoryFactory>, mode: InsertMode) -> Self {
        let pending: Arc<DashMap<String, Arc<Notify>>> = Arc::new(DashMap::new());
        let (sender, workers) = match mode {
            InsertMode::Sync => (None, Vec::new()),
            InsertMode::Async => {
                let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                let rx = Arc::new(Mutex::new(rx));
                let workers = (0..WORKER_COUNT)
                    .map(|_| tokio::spawn(worker_loop(repos.clone(), rx.clone(), pending.clone())))
                    .collect();
                (Some(tx), workers)
            }
        };
        Self { repos, mode, sender: Mutex::new(sender), pending, workers: Mutex::new(workers) }
    }

    /// Always executed inline: the caller needs the assigned row id back
    /// immediately to register the task in `SessionRegistry`.
    pub async fn save_task(&self, record: TaskRecord) -> Result<i64, fntrace_store::StoreError> {
        self.repos.task_repository().save_task(&record).await
    }

    /// Always executed inline: the caller needs the assigned row id back
    /// immediately to store it in the `TtlCache` for later patches.
    pub async fn save_param_cache(&self, cache: ParamCache) -> Result<i64, fntrace_store::StoreError> {
        self.repos.param_repository().save_param_cache(&cache).await
    }

    async fn wait_for_pending(&self, key: &str) {
        if let Some(notify) = self.pending.get(key).map(|e| e.clone()) {
            notify.notified().await;
        }
    }

    /// Accepts one op, typically forwarded from a session's outbound
    /// channel. `UpdateTrace` waits for its matching `SaveTrace` to have
    /// landed first, since the two can otherwise be picked up by different
    /// workers in the async pool and executed out of order.
    pub(crate) async fn submit(&self, op: Op) {
        if let Op::UpdateTrace { id, .. } = &op {
            self.wait_for_pending(&format!("trace:{id}")).await;
        }

        let key = op.pending_key();
        if op.is_insert() {
            if let Some(key) = &key {
                self.pending.entry(key.clone()).or_insert_with(|| Arc::new(Notify::new()));
            }
        }

        let sender = self.sender.lock().await.clone();
        match (&self.mode, sender) {
            (InsertMode::Async, Some(sender)) => match sender.try_send(op) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(op)) | Err(mpsc::error::TrySendError::Closed(op)) => {
                    warn!("persistence channel unavailable, executing write inline");
                    execute(&self.repos, op, &self.pending).await;
                }
            },
            _ => {
                let repos = self.repos.clone();
                let pending = self.pending.clone();
                execute(&repos, op, &pending).await;
            }
        }
    }

    /// Stops accepting new async writes, drains whatever is already
    /// queued, and waits for every worker to exit. `Sync` mode has nothing
    /// to drain since every write already completed before returning.
    /// Idempotent: a second call finds no sender and no workers left.
    pub async fn close(&self) {
        // Dropping the sole sender closes the channel once this drops: any
        // send still racing `dispatch` either already landed in the queue
        // (and will be drained below) or falls back to its own inline
        // execution against a `Closed` error.
        self.sender.lock().await.take();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            let _ = worker.await;
        }
    }
}

/// One worker in the pool: takes the receiver mutex only long enough to
/// pull the next op, then releases it so sibling workers can pull
/// concurrently while this one executes the (potentially slow) backend
/// call.
async fn worker_loop(
    repos: Arc<dyn RepositoryFactory>,
    rx: Arc<Mutex<mpsc::Receiver<Op>>>,
    pending: Arc<DashMap<String, Arc<Notify>>>,
) {
    loop {
        let op = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        match op {
            Some(op) => execute(&repos, op, &pending).await,
            None => return,
        }
    }
}

async fn execute(repos: &Arc<dyn RepositoryFactory>, op: Op, pending: &Arc<DashMap<String, Arc<Notify>>>) {
    let key = op.pending_key();
    match op {
        Op::SaveTrace(record) => {
            if let Err(err) = repos.trace_repository().save_trace(&record).await {
                warn!(?err, "failed to save trace record");
            }
        }
        Op::UpdateTrace { id, elapsed } => {
            if let Err(err) = repos.trace_repository().update_trace_time_cost(id, &elapsed).await {
                warn!(?err, id, "failed to update trace record");
            }
        }
        Op::UpdateTask { id, elapsed, finished } => {
            if let Err(err) = repos.task_repository().update_task_time_cost(id, &elapsed, finished).await {
                warn!(?err, id, "failed to update task record");
            }
        }
        Op::SaveParam(record) => {
            if let Err(err) = repos.param_repository().save_param(&record).await {
                warn!(?err, "failed to save param record");
            }
        }
    }
    if let Some(key) = key {
        if let Some((_, notify)) = pending.remove(&key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fntrace_store::MethodKind;

    fn trace_record(id: i64) -> TraceRecord {
        TraceRecord {
            id,
            name: "demo.Compute".into(),
            task_id: 1,
            depth: 0,
            param_count: 0,
            parent_id: 0,
            created_at: chrono::Utc::now().to_rfc3339(),
            sequence: id.to_string(),
            elapsed: String::new(),
            finished: false,
            method_kind: MethodKind::Plain,
        }
    }

    #[tokio::test]
    async fn sync_mode_save_then_update_completes_inline() {
        let dir = tempfile::tempdir().unwrap();
        let factory = fntrace_store::SqliteFactory::initialize(dir.path().join("t.db")).await.unwrap();
        let repos: Arc<dyn RepositoryFactory> = Arc::new(factory);
        let pipeline = PersistencePipeline::new(repos.clone(), InsertMode::Sync);

        pipeline.submit(Op::SaveTrace(trace_record(1))).await;
        pipeline.submit(Op::UpdateTrace { id: 1, elapsed: "1ms".into() }).await;

        let roots = repos.trace_repository().find_root_functions_by_task(1).await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].elapsed, "1ms");
    }

    #[tokio::test]
    async fn async_mode_update_waits_for_its_insert() {
        let dir = tempfile::tempdir().unwrap();
        let factory = fntrace_store::SqliteFactory::initialize(dir.path().join("t.db")).await.unwrap();
        let repos: Arc<dyn RepositoryFactory> = Arc::new(factory);
        let pipeline = PersistencePipeline::new(repos.clone(), InsertMode::Async);

        pipeline.submit(Op::SaveTrace(trace_record(2))).await;
        pipeline.submit(Op::UpdateTrace { id: 2, elapsed: "2ms".into() }).await;
        pipeline.close().await;

        let roots = repos.trace_repository().find_root_functions_by_task(1).await.unwrap();
        let found = roots.iter().find(|r| r.id == 2).expect("trace 2 present");
        assert_eq!(found.elapsed, "2ms");
    }
}
