//! The public Enter/Exit surface.
//!
//! A host inserts one `tracer.enter(name, &params)` at the top of a
//! function and a matching `tracer.exit(handle)` on every return path
//! (typically via a drop guard; see [`Guard`] below). Nothing here reads
//! arguments reflectively: `name` classifies the call and `params` carries
//! whatever the call site already chose to capture via
//! [`crate::capture::plain`] / [`crate::capture::receiver`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;

use chrono::Utc;
use dashmap::DashMap;
use fntrace_store::{ParamCache, ParamRecord, RepositoryFactory, TaskRecord, TraceRecord};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::capture::{self, Param};
use crate::config::{Config, ParamStoreMode};
use crate::dump::{DumpOptions, Dumper, JsonDumper};
use crate::error::TraceError;
use crate::ids::IdGenerator;
use crate::lifecycle::LifecycleMonitor;
use crate::logfile;
use crate::memory::MemoryMonitor;
use crate::pipeline::{Op, PersistencePipeline};
use crate::session::{Session, SessionRegistry};
use crate::task;
use crate::ttl::{self, TtlCache};

/// The name `Exit` treats as the program's entry point leaving: seeing it
/// return to depth zero triggers a clean shutdown of the pipeline, mirroring
/// how a host process's top-level function leaving means there is nothing
/// left to trace.
pub const ENTRY_POINT_NAME: &str = "main.main";

/// True for `main.main` itself or any package path ending in `/main.main`.
fn is_entry_point(name: &str) -> bool {
    name == ENTRY_POINT_NAME || name.ends_with("/main.main")
}

/// Process start, used to stamp each `TraceRecord`'s `sequence` field as
/// decimal seconds-since-startup, to two decimal places.
static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

fn sequence_now() -> String {
    format!("{:.2}", PROCESS_START.elapsed().as_secs_f64())
}

pub struct Tracer {
    config: Config,
    repos: Arc<dyn RepositoryFactory>,
    pipeline: Arc<PersistencePipeline>,
    trace_ids: Arc<IdGenerator>,
    param_ids: IdGenerator,
    registry: Arc<SessionRegistry>,
    ttl: Arc<TtlCache>,
    dumper: Arc<dyn Dumper>,
    dump_opts: DumpOptions,
    classification_cache: DashMap<String, fntrace_store::MethodKind>,
    shutting_down: AtomicBool,
    stop: Arc<Notify>,
    background: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Tracer {
    /// Builds the tracer and spawns its background monitors: memory
    /// ceiling enforcement (only when parameter capture is enabled, spec
    /// §4.6), abandoned-task reconciliation, and, in "all" capture mode,
    /// the TTL cache sweeper. Call [`Tracer::close`] to stop and drain them
    /// at shutdown.
    pub fn init(config: Config, repos: Arc<dyn RepositoryFactory>) -> Arc<Self> {
        let dump_opts = DumpOptions {
            max_depth: config.max_depth,
            max_elements_per_container: config.max_elements_per_container,
        };
        let pipeline = Arc::new(PersistencePipeline::new(repos.clone(), config.insert_mode));
        let registry = Arc::new(SessionRegistry::new());
        let ttl = Arc::new(TtlCache::new());
        let monitor_interval = config.monitor_interval;
        let memory_limit = config.memory_limit;
        let param_store_mode = config.param_store_mode;
        let stop = Arc::new(Notify::new());

        let tracer = Arc::new(Self {
            config,
            repos: repos.clone(),
            pipeline,
            trace_ids: Arc::new(IdGenerator::new()),
            param_ids: IdGenerator::new(),
            registry: registry.clone(),
            ttl: ttl.clone(),
            dumper: Arc::new(JsonDumper),
            dump_opts,
            classification_cache: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            stop: stop.clone(),
            background: tokio::sync::Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();

        // Spec §4.6: "Only engaged when parameter capture mode is not
        // 'none'" — a tracer that records no parameters can't build up the
        // retained snapshots the ceiling guards against.
        if !matches!(param_store_mode, ParamStoreMode::None) {
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                MemoryMonitor::new(memory_limit, crate::memory::DEFAULT_SAMPLE_INTERVAL).run(stop).await;
            }));
        }

        handles.push(tokio::spawn({
            let registry = registry.clone();
            let stop = stop.clone();
            async move {
                LifecycleMonitor::new(registry, monitor_interval).run(stop).await;
            }
        }));

        // The TTL cache only ever gets entries in "all" mode (delta
        // capture); sweeping it otherwise would just be a no-op loop.
        if matches!(param_store_mode, ParamStoreMode::All) {
            let ttl = ttl.clone();
            let repos = repos.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                ttl::run_sweeper(ttl, repos, ttl::DEFAULT_CHECK_INTERVAL, stop).await;
            }));
        }

        // Stash the handles now that `tracer` exists; nothing above can
        // race `close()` since it's not reachable until `init` returns.
        if let Ok(mut guard) = tracer.background.try_lock() {
            *guard = handles;
        }

        tracer
    }

    /// Overrides the default JSON dumper, e.g. to apply host-specific
    /// redaction before parameters are serialized.
    pub fn with_dumper(self: Arc<Self>, dumper: Arc<dyn Dumper>) -> Arc<Self> {
        Arc::new(Self { dumper, ..Arc::try_unwrap_or_clone(self) })
    }

    /// Returns a handle to the process-wide `tracing` subscriber a host
    /// application installed; `fntrace` never installs one of its own.
    pub fn get_logger() -> tracing::Dispatch {
        tracing::dispatcher::get_default(|d| d.clone())
    }

    fn classify_cached(&self, name: &str) -> fntrace_store::MethodKind {
        if let Some(kind) = self.classification_cache.get(name) {
            return *kind;
        }
        let kind = capture::classify(name);
        self.classification_cache.insert(name.to_string(), kind);
        kind
    }

    pub async fn enter(&self, name: &'static str, params: &[Param]) -> Handle {
        let task_id = task::current_task_id();

        if self.config.is_ignored(name) {
            return Handle {
                trace_id: -1,
                task_id,
                name,
                method_kind: fntrace_store::MethodKind::Unknown,
                depth: 0,
                parent_id: None,
                started_at: Instant::now(),
            };
        }

        let session = self.registry.get_or_create(task_id, self.trace_ids.clone(), self.pipeline.clone());

        let needs_task_row = session.task_row_id.lock().unwrap().is_none();
        if needs_task_row {
            let row = TaskRecord {
                id: 0,
                origin_task_id: task_id,
                init_func_name: name.to_string(),
                create_time: task::current_task_create_time().to_rfc3339(),
                elapsed: String::new(),
                finished: false,
            };
            match self.pipeline.save_task(row).await {
                Ok(task_row_id) => *session.task_row_id.lock().unwrap() = Some(task_row_id),
                Err(err) => warn!(?err, "failed to register task"),
            }
        }

        let kind = self.classify_cached(name);
        let (depth, parent_id, trace_id) = session.prepare_enter();

        let record = TraceRecord {
            id: trace_id,
            name: name.to_string(),
            task_id,
            depth: depth as i32,
            param_count: params.len() as i32,
            parent_id,
            created_at: Utc::now().to_rfc3339(),
            sequence: sequence_now(),
            elapsed: String::new(),
            finished: false,
            method_kind: kind,
        };
        session.enqueue(Op::SaveTrace(record)).await;
        let logged_parent = if parent_id == 0 { None } else { Some(parent_id) };
        logfile::log_enter(name, task_id, depth, logged_parent, params.len(), kind);

        self.capture_params(&session, kind, trace_id, params).await;

        Handle { trace_id, task_id, name, method_kind: kind, depth, parent_id: logged_parent, started_at: Instant::now() }
    }

    async fn capture_params(&self, session: &Arc<Session>, kind: fntrace_store::MethodKind, trace_id: i64, params: &[Param]) {
        // Spec §7: "Panics anywhere inside the runtime: recovered by a guard
        // that logs the panic and stack; the guarded operation is
        // abandoned." Serialization (the dumper, the merge-patch diff) is
        // the only part of a call to `Enter` that runs arbitrary user
        // `Serialize` impls, so it's the one guarded with `catch_unwind`;
        // user code itself is never caught.
        let prepared = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            capture::prepare(kind, self.config.param_store_mode, params, &self.dumper, &self.dump_opts, &self.ttl)
        })) {
            Ok(prepared) => prepared,
            Err(payload) => {
                warn!(panic = %crate::error::panic_message(&payload), trace_id, "param capture panicked, abandoning capture for this call");
                return;
            }
        };
        for p in prepared {
            if let Some((key, snapshot)) = p.new_cache_snapshot {
                // Cache miss: this ParamRecord *is* the anchor snapshot, so
                // it must exist (with base_id=0) before the ParamCache row
                // can point its own base_id at it.
                let anchor_id = self.param_ids.next() as i64;
                let cache_data = p.data.clone();
                let record = ParamRecord {
                    id: anchor_id,
                    trace_id,
                    position: p.position as i32,
                    data: p.data,
                    is_receiver: p.is_receiver,
                    base_id: 0,
                };
                session.enqueue(Op::SaveParam(record)).await;

                let cache = ParamCache { id: 0, key: key.clone(), base_id: anchor_id, data: cache_data };
                match self.pipeline.save_param_cache(cache).await {
                    Ok(_) => self.ttl.store(&key, anchor_id, snapshot),
                    Err(err) => warn!(?err, "failed to persist param cache row"),
                }
                continue;
            }

            let record = ParamRecord {
                id: self.param_ids.next() as i64,
                trace_id,
                position: p.position as i32,
                data: p.data,
                is_receiver: p.is_receiver,
                base_id: p.base_id.unwrap_or(0),
            };
            session.enqueue(Op::SaveParam(record)).await;
        }
    }

    pub async fn exit(&self, handle: Handle) {
        if handle.trace_id < 0 {
            return;
        }
        let Some(session) = self.registry.get(handle.task_id) else {
            warn!(task_id = handle.task_id, "exit called for a task with no open session; ignoring");
            return;
        };

        session.on_exit();
        let elapsed = handle.started_at.elapsed();
        session.enqueue(Op::UpdateTrace { id: handle.trace_id, elapsed: format!("{elapsed:?}") }).await;
        logfile::log_exit(handle.name, handle.task_id, handle.depth, elapsed.as_micros());

        if session.depth() == 0 {
            let task_row_id = *session.task_row_id.lock().unwrap();
            if let Some(task_row_id) = task_row_id {
                session.enqueue(Op::UpdateTask { id: task_row_id, elapsed: format!("{elapsed:?}"), finished: true }).await;
            }
            if is_entry_point(handle.name) {
                if let Err(err) = self.close().await {
                    warn!(?err, "error during shutdown triggered by main.main exit");
                }
            }
        }
    }

    /// Stops the background monitors, drains every open task's session and
    /// the process-wide pipeline, and closes the backing store. Idempotent:
    /// a second call after shutdown is a no-op that returns `Ok(())`.
    pub async fn close(&self) -> Result<(), TraceError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("fntrace shutting down, draining pipeline");

        // (a) stop LifecycleMonitor, (b) stop TtlCache's sweeper, (c) stop
        // MemoryMonitor: all three share one stop signal and exit their
        // `tokio::select!` on the next iteration.
        self.stop.notify_waiters();
        let monitors = std::mem::take(&mut *self.background.lock().await);
        for monitor in monitors {
            let _ = monitor.await;
        }

        // (d) close every still-open task's Session (drains its outbound
        // queue) before the shared pipeline stops accepting new work.
        for task_id in self.registry.registered_task_ids() {
            if let Some(session) = self.registry.remove(task_id) {
                session.close().await;
            }
        }

        // (e) stop accepting new async ops and drain the channel, (f) wait
        // for every worker to exit.
        self.pipeline.close().await;

        // (g) close the backend.
        self.repos.close().await?;
        Ok(())
    }
}

/// Returned by [`Tracer::enter`], consumed by the matching
/// [`Tracer::exit`]. Opaque to callers beyond the fields they can read.
pub struct Handle {
    pub trace_id: i64,
    pub task_id: u64,
    pub name: &'static str,
    pub method_kind: fntrace_store::MethodKind,
    pub depth: usize,
    pub parent_id: Option<i64>,
    pub started_at: Instant,
}

/// Returned by [`Tracer::enter_guarded`]; calling [`Tracer::exit`] on drop
/// so a single `let _guard = tracer.enter_guarded(...)` at the top of a
/// function covers every return path, panicking ones included.
pub struct Guard {
    tracer: Arc<Tracer>,
    handle: Option<Handle>,
}

impl Tracer {
    /// Like [`Tracer::enter`], but returns a [`Guard`] that calls
    /// [`Tracer::exit`] when dropped instead of requiring the caller to
    /// call it explicitly.
    pub async fn enter_guarded(self: &Arc<Self>, name: &'static str, params: &[Param]) -> Guard {
        let handle = self.enter(name, params).await;
        Guard { tracer: self.clone(), handle: Some(handle) }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let tracer = self.tracer.clone();
            tokio::spawn(async move { tracer.exit(handle).await });
        }
    }
}

#[cfg(not(feature = "nightly-try-unwrap-or-clone"))]
trait TryUnwrapOrClone {
    fn try_unwrap_or_clone(self) -> Tracer;
}

// `Arc::try_unwrap_or_clone` is not yet stable; this is the manual
// equivalent restricted to what `with_dumper` needs (rebuilding a `Tracer`
// with every field but the dumper carried over unchanged). Cloning the
// `Arc`'s contents is cheap here since the fields are themselves handles
// (Arc/DashMap) rather than the underlying store. This path only runs when
// another `Arc<Tracer>` clone is still alive, which in practice means
// `with_dumper` is called before any background monitor could have been
// spawned against the original instance, so rebuilding them against fresh
// id generators and an empty `TtlCache` loses nothing already observed.
impl TryUnwrapOrClone for Arc<Tracer> {
    fn try_unwrap_or_clone(self) -> Tracer {
        match Arc::try_unwrap(self) {
            Ok(t) => t,
            Err(arc) => Tracer {
                config: arc.config.clone(),
                repos: arc.repos.clone(),
                pipeline: Arc::new(PersistencePipeline::new(arc.repos.clone(), arc.config.insert_mode)),
                trace_ids: Arc::new(IdGenerator::new()),
                param_ids: IdGenerator::new(),
                registry: arc.registry.clone(),
                ttl: Arc::new(TtlCache::new()),
                dumper: arc.dumper.clone(),
                dump_opts: arc.dump_opts,
                classification_cache: arc.classification_cache.clone(),
                shutting_down: AtomicBool::new(arc.shutting_down.load(Ordering::SeqCst)),
                stop: Arc::new(Notify::new()),
                background: tokio::sync::Mutex::new(Vec::new()),
            },
        }
    }
}
