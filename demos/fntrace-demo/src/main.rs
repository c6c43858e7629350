//! Three end-to-end scenarios against a real SQLite-backed `Tracer`,
//! mirroring the testable properties documented alongside this runtime:
//! linear nesting, pointer-receiver delta capture, and two tasks racing on
//! a shared receiver.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use fntrace::{capture, Config};
use fntrace_store::{RepositoryFactory, SqliteFactory};
use serde::Serialize;
use tracing::info;

#[derive(Serialize)]
struct Counter {
    count: i64,
}

async fn linear_nesting(tracer: &Arc<fntrace::Tracer>) {
    let outer = tracer.enter("demo.Outer", &[]).await;
    let middle = tracer.enter("demo.Middle", &[]).await;
    let inner = tracer.enter("demo.Inner", &[]).await;
    tracer.exit(inner).await;
    tracer.exit(middle).await;
    tracer.exit(outer).await;
    info!("linear nesting scenario complete");
}

async fn pointer_receiver_delta(tracer: &Arc<fntrace::Tracer>) {
    let counter = Counter { count: 0 };
    for _ in 0..3 {
        let session = tracer.enter("demo.(*Counter).Inc", &[capture::receiver(&counter)]).await;
        tracer.exit(session).await;
    }
    info!("pointer-receiver delta scenario complete");
}

async fn concurrent_shared_receiver(tracer: Arc<fntrace::Tracer>) {
    let counter = Arc::new(Counter { count: 0 });
    let finished = Arc::new(AtomicI64::new(0));

    // Each worker is its own logical task: wrapping it in `fntrace::scope`
    // gives it a task id that survives tokio's work-stealing scheduler
    // moving it across OS threads between awaits, which a bare
    // `tokio::spawn` cannot guarantee under the default multi-threaded
    // runtime this binary runs on.
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let tracer = tracer.clone();
        let counter = counter.clone();
        let finished = finished.clone();
        tasks.push(fntrace::task::spawn_traced(async move {
            for _ in 0..100 {
                let handle = tracer.enter("demo.(*Counter).Inc", &[capture::receiver(&*counter)]).await;
                tracer.exit(handle).await;
                finished.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for task in tasks {
        task.await.expect("worker task panicked");
    }
    info!(finished = finished.load(Ordering::SeqCst), "concurrent shared-receiver scenario complete");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let dir = tempfile_dir()?;
    let mut config = Config::default();
    config.param_store_mode = fntrace::config::ParamStoreMode::All;
    config.insert_mode = fntrace::config::InsertMode::Async;

    let factory = SqliteFactory::initialize(dir.join("fntrace-demo.db")).await?;
    let repos: Arc<dyn RepositoryFactory> = Arc::new(factory);
    let tracer = fntrace::Tracer::init(config, repos);

    // `main`'s own body is one logical task too: under tokio's default
    // multi-threaded runtime it can just as easily be resumed on a
    // different worker thread after an await as any of the tasks it
    // spawns below, so it gets the same `scope` wrapping they do.
    fntrace::scope(async {
        let entry = tracer.enter(fntrace::ENTRY_POINT_NAME, &[]).await;

        linear_nesting(&tracer).await;
        pointer_receiver_delta(&tracer).await;
        concurrent_shared_receiver(tracer.clone()).await;

        // Exiting `main.main` triggers `Tracer::close` internally, draining
        // the pipeline before the process exits.
        tracer.exit(entry).await;
    })
    .await;

    Ok(())
}

fn tempfile_dir() -> anyhow::Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join(format!("fntrace-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
