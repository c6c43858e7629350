//! Persistence traits: three repositories plus a factory that owns them.
//!
//! These traits are the seam between the tracing runtime and whatever
//! relational store backs it. `fntrace` depends only on these traits (via
//! `RepositoryFactory`); `sqlite.rs` is one concrete implementation.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{ParamCache, ParamRecord, TaskRecord, TraceRecord};

#[async_trait]
pub trait TraceRepository: Send + Sync {
    async fn save_trace(&self, record: &TraceRecord) -> Result<i64, StoreError>;
    async fn update_trace_time_cost(&self, id: i64, elapsed: &str) -> Result<(), StoreError>;
    async fn find_root_functions_by_task(&self, task_id: u64)
    -> Result<Vec<TraceRecord>, StoreError>;
}

#[async_trait]
pub trait ParamRepository: Send + Sync {
    async fn save_param(&self, record: &ParamRecord) -> Result<i64, StoreError>;
    async fn find_params_by_trace_id(&self, trace_id: i64) -> Result<Vec<ParamRecord>, StoreError>;
    async fn save_param_cache(&self, cache: &ParamCache) -> Result<i64, StoreError>;
    async fn find_param_cache_by_key(&self, key: &str) -> Result<Option<ParamCache>, StoreError>;
    async fn delete_param_cache_by_key(&self, key: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn save_task(&self, record: &TaskRecord) -> Result<i64, StoreError>;
    async fn update_task_time_cost(
        &self,
        id: i64,
        elapsed: &str,
        finished: bool,
    ) -> Result<(), StoreError>;
    async fn find_task_by_id(&self, id: i64) -> Result<Option<TaskRecord>, StoreError>;
}

/// Owns the backend connection and hands out the three repositories.
#[async_trait]
pub trait RepositoryFactory: Send + Sync {
    fn trace_repository(&self) -> &dyn TraceRepository;
    fn param_repository(&self) -> &dyn ParamRepository;
    fn task_repository(&self) -> &dyn TaskRepository;
    async fn close(&self) -> Result<(), StoreError>;
}
