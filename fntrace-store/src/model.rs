use serde::{Deserialize, Serialize};

/// How a traced function's receiver (if any) was classified.
///
/// Determines how `ParamCapture` treats parameter position 0: a plain
/// function has no receiver, a value-receiver method owns a copy, a
/// pointer-receiver method aliases the caller's object and is eligible for
/// delta capture in "all" mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Unknown,
    Plain,
    ValueReceiver,
    PointerReceiver,
}

impl MethodKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MethodKind::Unknown => "unknown",
            MethodKind::Plain => "plain",
            MethodKind::ValueReceiver => "value_receiver",
            MethodKind::PointerReceiver => "pointer_receiver",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "plain" => MethodKind::Plain,
            "value_receiver" => MethodKind::ValueReceiver,
            "pointer_receiver" => MethodKind::PointerReceiver,
            _ => MethodKind::Unknown,
        }
    }
}

/// One Enter/Exit pair. Created at Enter; mutated exactly once, at Exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: i64,
    pub name: String,
    pub task_id: u64,
    pub depth: i32,
    pub param_count: i32,
    pub parent_id: i64,
    pub created_at: String,
    pub sequence: String,
    pub elapsed: String,
    pub finished: bool,
    pub method_kind: MethodKind,
}

/// One captured parameter (or receiver snapshot/patch) for a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRecord {
    pub id: i64,
    pub trace_id: i64,
    pub position: i32,
    pub data: Vec<u8>,
    pub is_receiver: bool,
    pub base_id: i64,
}

/// The lifecycle record for one concurrent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub origin_task_id: u64,
    pub init_func_name: String,
    pub create_time: String,
    pub elapsed: String,
    pub finished: bool,
}

/// Cached pointer-receiver snapshot, keyed by stable object identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamCache {
    pub id: i64,
    pub key: String,
    pub base_id: i64,
    pub data: Vec<u8>,
}
