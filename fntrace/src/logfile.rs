//! Structured Enter/Exit log lines, emitted through `tracing` at debug
//! level so a host application's existing subscriber picks them up for
//! free; nothing here opens a file of its own — log rotation is left to an
//! external file writer, a host wires a rotating `tracing` layer in if it
//! wants one.
//!
//! The message text is fixed: `<indent-spaces>→ <name>` on entry and
//! `<indent-spaces>← <name> (<elapsed>)` on exit, with indentation equal to
//! two spaces per call-stack depth.

use fntrace_store::MethodKind;
use tracing::debug;

fn indent(depth: usize) -> String {
    " ".repeat(depth * 2)
}

pub fn log_enter(name: &str, task_id: u64, depth: usize, parent_id: Option<i64>, params: usize, kind: MethodKind) {
    let pad = indent(depth);
    debug!(
        task = task_id,
        name,
        depth,
        parent_id = parent_id.unwrap_or(0),
        params,
        method_kind = kind.as_db_str(),
        "{pad}\u{2192} {name}"
    );
}

pub fn log_exit(name: &str, task_id: u64, depth: usize, elapsed_micros: u128) {
    let pad = indent(depth);
    let elapsed = format!("{}µs", elapsed_micros);
    debug!(task = task_id, name, depth, duration = %elapsed, "{pad}\u{2190} {name} ({elapsed})");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indent_is_two_spaces_per_depth() {
        assert_eq!(indent(0), "");
        assert_eq!(indent(1), "  ");
        assert_eq!(indent(2), "    ");
    }
}
