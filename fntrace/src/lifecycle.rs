//! Reconciles `SessionRegistry` against the set of tasks whose owning
//! scope (or, absent one, OS thread) is still alive, finalizing any task
//! row left open by a task that never called `Exit` back down to depth
//! zero (a panic that unwound past every frame, or a scope simply dropped
//! mid-call).

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::pipeline::Op;
use crate::session::SessionRegistry;
use crate::task::live_task_ids;

pub struct LifecycleMonitor {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl LifecycleMonitor {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Runs the reconciliation loop until `stop` fires.
    pub async fn run(&self, stop: Arc<tokio::sync::Notify>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.notified() => return,
            }
            self.reconcile_once().await;
        }
    }

    /// One reconciliation pass, split out so tests can drive it without a
    /// sleep loop.
    pub async fn reconcile_once(&self) {
        let live: std::collections::HashSet<u64> = live_task_ids().into_iter().collect();
        for task_id in self.registry.registered_task_ids() {
            if live.contains(&task_id) {
                continue;
            }
            let Some(session) = self.registry.remove(task_id) else { continue };
            let elapsed = session.started_at.elapsed();
            let task_row_id = *session.task_row_id.lock().unwrap();
            if let Some(task_row_id) = task_row_id {
                session.enqueue(Op::UpdateTask { id: task_row_id, elapsed: format!("{elapsed:?}"), finished: true }).await;
            } else {
                warn!(task_id, "abandoned task had no registered row to finalize");
            }
            // Gracefully close the Session (drains its outbound queue)
            // before dropping the last reference to it.
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InsertMode;
    use crate::ids::IdGenerator;
    use crate::pipeline::PersistencePipeline;
    use fntrace_store::RepositoryFactory;

    async fn test_registry() -> (Arc<SessionRegistry>, Arc<IdGenerator>, Arc<PersistencePipeline>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let factory = fntrace_store::SqliteFactory::initialize(dir.path().join("t.db")).await.unwrap();
        let repos: Arc<dyn RepositoryFactory> = Arc::new(factory);
        let pipeline = Arc::new(PersistencePipeline::new(repos, InsertMode::Sync));
        (Arc::new(SessionRegistry::new()), Arc::new(IdGenerator::new()), pipeline, dir)
    }

    #[tokio::test]
    async fn abandoned_task_is_removed_from_the_registry() {
        let (registry, ids, pipeline, _dir) = test_registry().await;
        // given: a task registered under an id no thread/scope holds live
        let session = registry.get_or_create(999_999, ids, pipeline);
        session.prepare_enter();
        session.on_exit();
        let monitor = LifecycleMonitor::new(registry.clone(), Duration::from_secs(60));

        // when: a reconciliation pass runs
        monitor.reconcile_once().await;

        // then: the abandoned entry is gone
        assert!(!registry.contains(999_999));
    }

    #[tokio::test]
    async fn live_task_is_left_alone() {
        let (registry, ids, pipeline, _dir) = test_registry().await;
        let task_id = crate::task::current_task_id();
        registry.get_or_create(task_id, ids, pipeline);

        let monitor = LifecycleMonitor::new(registry.clone(), Duration::from_secs(60));
        monitor.reconcile_once().await;
        assert!(registry.contains(task_id));
    }
}
