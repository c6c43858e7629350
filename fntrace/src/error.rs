use std::any::Any;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("store error: {0}")]
    Store(#[from] fntrace_store::StoreError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Turns a `catch_unwind` payload into a loggable string. Param capture runs
/// arbitrary `Serialize` impls supplied by the instrumented program, so a
/// panic there carries no stronger guarantee than the usual `&str`/`String`
/// payload convention used throughout the standard library.
pub fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
