//! SQLite-backed implementation of the persistence interface.
//!
//! Uses sqlx directly: `CREATE TABLE IF NOT EXISTS` at startup, explicit
//! `.bind()` chains per query, `Row::get` by position.

use std::path::Path;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{MethodKind, ParamCache, ParamRecord, TaskRecord, TraceRecord};
use crate::repo::{ParamRepository, RepositoryFactory, TaskRepository, TraceRepository};

pub struct SqliteFactory {
    pool: SqlitePool,
}

impl SqliteFactory {
    /// Open (or create) the SQLite database at `db_path` and ensure the
    /// schema exists.
    pub async fn initialize<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trace_data (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                task_id INTEGER NOT NULL,
                indent INTEGER NOT NULL,
                params_count INTEGER NOT NULL,
                elapsed TEXT NOT NULL DEFAULT '',
                parent_id INTEGER NOT NULL,
                finished INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                seq TEXT NOT NULL,
                method_kind TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trace_task_id ON trace_data(task_id);
            CREATE INDEX IF NOT EXISTS idx_trace_parent_id ON trace_data(parent_id);

            CREATE TABLE IF NOT EXISTS task_trace (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin_task_id INTEGER NOT NULL,
                elapsed TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL,
                finished INTEGER NOT NULL DEFAULT 0,
                init_func_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS param_store (
                id INTEGER PRIMARY KEY,
                trace_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                data BLOB NOT NULL,
                is_receiver INTEGER NOT NULL DEFAULT 0,
                base_id INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_param_trace_id ON param_store(trace_id);
            CREATE INDEX IF NOT EXISTS idx_param_base_id ON param_store(base_id);

            CREATE TABLE IF NOT EXISTS param_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                base_id INTEGER NOT NULL,
                data BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_param_cache_key ON param_cache(key);
            "#,
        )
        .execute(&pool)
        .await?;

        info!("fntrace store initialized at {}", db_path.as_ref().display());
        Ok(Self { pool })
    }
}

#[async_trait]
impl RepositoryFactory for SqliteFactory {
    fn trace_repository(&self) -> &dyn TraceRepository {
        self
    }

    fn param_repository(&self) -> &dyn ParamRepository {
        self
    }

    fn task_repository(&self) -> &dyn TaskRepository {
        self
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl TraceRepository for SqliteFactory {
    async fn save_trace(&self, record: &TraceRecord) -> Result<i64, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trace_data (
                id, name, task_id, indent, params_count, elapsed, parent_id,
                finished, created_at, seq, method_kind
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(record.task_id as i64)
        .bind(record.depth)
        .bind(record.param_count)
        .bind(&record.elapsed)
        .bind(record.parent_id)
        .bind(record.finished as i64)
        .bind(&record.created_at)
        .bind(&record.sequence)
        .bind(record.method_kind.as_db_str())
        .execute(&self.pool)
        .await?;

        debug!("saved trace #{} ({})", record.id, record.name);
        Ok(record.id)
    }

    async fn update_trace_time_cost(&self, id: i64, elapsed: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE trace_data SET elapsed = ?, finished = 1 WHERE id = ?")
            .bind(elapsed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_root_functions_by_task(
        &self,
        task_id: u64,
    ) -> Result<Vec<TraceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, task_id, indent, params_count, parent_id,
                   created_at, seq, elapsed, finished, method_kind
            FROM trace_data
            WHERE task_id = ? AND indent = 0
            ORDER BY id ASC
            "#,
        )
        .bind(task_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_trace).collect())
    }
}

fn row_to_trace(r: sqlx::sqlite::SqliteRow) -> TraceRecord {
    TraceRecord {
        id: r.get(0),
        name: r.get(1),
        task_id: r.get::<i64, _>(2) as u64,
        depth: r.get(3),
        param_count: r.get(4),
        parent_id: r.get(5),
        created_at: r.get(6),
        sequence: r.get(7),
        elapsed: r.get(8),
        finished: r.get::<i64, _>(9) != 0,
        method_kind: MethodKind::from_db_str(&r.get::<String, _>(10)),
    }
}

#[async_trait]
impl ParamRepository for SqliteFactory {
    async fn save_param(&self, record: &ParamRecord) -> Result<i64, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO param_store (id, trace_id, position, data, is_receiver, base_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(record.trace_id)
        .bind(record.position)
        .bind(&record.data)
        .bind(record.is_receiver as i64)
        .bind(record.base_id)
        .execute(&self.pool)
        .await?;
        Ok(record.id)
    }

    async fn find_params_by_trace_id(&self, trace_id: i64) -> Result<Vec<ParamRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, trace_id, position, data, is_receiver, base_id
            FROM param_store WHERE trace_id = ? ORDER BY position ASC
            "#,
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ParamRecord {
                id: r.get(0),
                trace_id: r.get(1),
                position: r.get(2),
                data: r.get(3),
                is_receiver: r.get::<i64, _>(4) != 0,
                base_id: r.get(5),
            })
            .collect())
    }

    async fn save_param_cache(&self, cache: &ParamCache) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO param_cache (key, base_id, data) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET base_id = excluded.base_id, data = excluded.data
            "#,
        )
        .bind(&cache.key)
        .bind(cache.base_id)
        .bind(&cache.data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 && result.last_insert_rowid() > 0 {
            return Ok(result.last_insert_rowid());
        }

        let row = sqlx::query("SELECT id FROM param_cache WHERE key = ?")
            .bind(&cache.key)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    async fn find_param_cache_by_key(&self, key: &str) -> Result<Option<ParamCache>, StoreError> {
        let row = sqlx::query("SELECT id, key, base_id, data FROM param_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| ParamCache {
            id: r.get(0),
            key: r.get(1),
            base_id: r.get(2),
            data: r.get(3),
        }))
    }

    async fn delete_param_cache_by_key(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM param_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

}

#[async_trait]
impl TaskRepository for SqliteFactory {
    async fn save_task(&self, record: &TaskRecord) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_trace (origin_task_id, elapsed, create_time, finished, init_func_name)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.origin_task_id as i64)
        .bind(&record.elapsed)
        .bind(&record.create_time)
        .bind(record.finished as i64)
        .bind(&record.init_func_name)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_task_time_cost(
        &self,
        id: i64,
        elapsed: &str,
        finished: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE task_trace SET elapsed = ?, finished = ? WHERE id = ?")
            .bind(elapsed)
            .bind(finished as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_task_by_id(&self, id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, origin_task_id, init_func_name, create_time, elapsed, finished FROM task_trace WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TaskRecord {
            id: r.get(0),
            origin_task_id: r.get::<i64, _>(1) as u64,
            init_func_name: r.get(2),
            create_time: r.get(3),
            elapsed: r.get(4),
            finished: r.get::<i64, _>(5) != 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_tmp() -> (SqliteFactory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fntrace.db");
        let factory = SqliteFactory::initialize(&path).await.unwrap();
        (factory, dir)
    }

    #[tokio::test]
    async fn trace_insert_then_update_round_trips() {
        let (store, _dir) = open_tmp().await;
        let record = TraceRecord {
            id: 1,
            name: "pkg.Foo".into(),
            task_id: 7,
            depth: 0,
            param_count: 0,
            parent_id: 0,
            created_at: "2026-01-01T00:00:00.000000000Z".into(),
            sequence: "0.01".into(),
            elapsed: String::new(),
            finished: false,
            method_kind: MethodKind::Plain,
        };
        store.trace_repository().save_trace(&record).await.unwrap();
        store
            .trace_repository()
            .update_trace_time_cost(1, "1.2ms")
            .await
            .unwrap();

        let roots = store
            .trace_repository()
            .find_root_functions_by_task(7)
            .await
            .unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].elapsed, "1.2ms");
        assert!(roots[0].finished);
    }

    #[tokio::test]
    async fn param_cache_upsert_is_idempotent_by_key() {
        let (store, _dir) = open_tmp().await;
        let cache = ParamCache {
            id: 0,
            key: "pkg.Widget@0xdead".into(),
            base_id: 1,
            data: vec![1, 2, 3],
        };
        let first_id = store.param_repository().save_param_cache(&cache).await.unwrap();
        let second = ParamCache {
            data: vec![4, 5, 6],
            ..cache
        };
        let second_id = store.param_repository().save_param_cache(&second).await.unwrap();
        assert_eq!(first_id, second_id);

        let found = store
            .param_repository()
            .find_param_cache_by_key("pkg.Widget@0xdead")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.data, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn task_lifecycle_round_trips() {
        let (store, _dir) = open_tmp().await;
        let record = TaskRecord {
            id: 0,
            origin_task_id: 42,
            init_func_name: "main.main".into(),
            create_time: "2026-01-01T00:00:00Z".into(),
            elapsed: String::new(),
            finished: false,
        };
        let id = store.task_repository().save_task(&record).await.unwrap();
        store
            .task_repository()
            .update_task_time_cost(id, "3.4s", true)
            .await
            .unwrap();

        let found = store.task_repository().find_task_by_id(id).await.unwrap().unwrap();
        assert!(found.finished);
        assert_eq!(found.elapsed, "3.4s");
    }
}
