//! Naming helpers for the explicit `name` argument `Enter` takes.
//!
//! Rust gives us no runtime equivalent of a caller's fully qualified name,
//! so the name has to come from the call site itself, either via the
//! [`function_name`] macro (works for plain functions and value-receiver
//! methods, whose path `std::any::type_name` already spells out) or, for a
//! pointer-receiver method, via [`ptr_method_name`] — Rust's `type_name`
//! does not encode whether a method took `&self` or `self`, so that one
//! case has to be spelled out by the caller.
//!
//! [`classify`](crate::capture::classify) matches dot-separated names
//! (mirroring the Go call-site names the patterns were modeled on), while
//! `type_name` yields `::`-separated paths, so the macro converts `::` to
//! `.` before handing the name back. That conversion is cached behind a
//! per-call-site `OnceLock` rather than redone on every call: resolve once,
//! reuse forever.

/// Expands to this function's (or method's) fully qualified path, e.g.
/// `my_crate.widgets.Counter.snapshot` for a value-receiver method, or
/// `my_crate.compute` for a plain function. Classified by [`crate::capture::classify`]
/// as `ValueReceiver` or `Plain` respectively.
#[macro_export]
macro_rules! function_name {
    () => {{
        fn marker() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        static NAME: ::std::sync::OnceLock<String> = ::std::sync::OnceLock::new();
        NAME.get_or_init(|| {
            let full = type_name_of(marker);
            let trimmed = &full[..full.len() - "marker".len() - 2];
            trimmed.replace("::", ".")
        })
        .as_str()
    }};
}

/// Formats the dotted name classified as a pointer-receiver method:
/// `<module_path>.(*<Type>).<method>`. Call with `module_path!()` for the
/// first argument.
pub fn ptr_method_name(module_path: &str, type_name: &str, method: &str) -> String {
    format!("{module_path}.(*{type_name}).{method}")
}

/// Formats the dotted name classified as a value-receiver method:
/// `<module_path>.<Type>.<method>`.
pub fn value_method_name(module_path: &str, type_name: &str, method: &str) -> String {
    format!("{module_path}.{type_name}.{method}")
}

#[cfg(test)]
mod tests {
    use crate::capture::classify;
    use fntrace_store::MethodKind;

    #[test]
    fn function_name_macro_classifies_as_plain() {
        fn sample() -> &'static str {
            function_name!()
        }
        let name = sample();
        assert_eq!(classify(name), MethodKind::Plain);
    }

    #[test]
    fn ptr_method_name_classifies_as_pointer_receiver() {
        let name = super::ptr_method_name("demo", "Counter", "inc");
        assert_eq!(name, "demo.(*Counter).inc");
        assert_eq!(classify(&name), MethodKind::PointerReceiver);
    }

    #[test]
    fn value_method_name_classifies_as_value_receiver() {
        let name = super::value_method_name("demo", "Counter", "snapshot");
        assert_eq!(name, "demo.Counter.snapshot");
        assert_eq!(classify(&name), MethodKind::ValueReceiver);
    }
}
