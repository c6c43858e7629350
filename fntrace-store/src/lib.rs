pub mod error;
pub mod model;
pub mod repo;
pub mod sqlite;

pub use error::StoreError;
pub use model::{MethodKind, ParamCache, ParamRecord, TaskRecord, TraceRecord};
pub use repo::{ParamRepository, RepositoryFactory, TaskRepository, TraceRepository};
pub use sqlite::SqliteFactory;
