//! In-process function-call tracing runtime.
//!
//! A host instruments a function by calling [`Tracer::enter`] at the top
//! and [`Tracer::exit`] (or, more conveniently, dropping the [`Guard`]
//! returned by [`Tracer::enter_guarded`]) on every return path. Entries and
//! exits are persisted asynchronously through a
//! [`pipeline::PersistencePipeline`] to whatever
//! [`fntrace_store::RepositoryFactory`] the host wires up; task lifecycle
//! and a process memory ceiling are enforced by background monitors started
//! in [`Tracer::init`].

pub mod api;
pub mod capture;
pub mod compress;
pub mod config;
pub mod dump;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod logfile;
pub mod macros;
pub mod memory;
pub mod patch;
pub mod pipeline;
pub mod session;
pub mod task;
pub mod ttl;

pub use api::{Guard, Handle, Tracer, ENTRY_POINT_NAME};
pub use capture::{plain, receiver, Param};
pub use config::{Config, InsertMode, ParamStoreMode};
pub use dump::{DumpOptions, Dumper, JsonDumper};
pub use error::TraceError;
pub use session::{Session, SessionRegistry};
pub use task::scope;
