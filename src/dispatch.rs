use rhai::{CallFnOptions, Dynamic, FnAccess, Scope, AST};

use crate::error::{root_cause, BridgeError};
use crate::runtime::{AnyRef, CallContext, ObjectRef};

pub(crate) fn invoke(
    ctx: CallContext<'_>,
    target: &ObjectRef,
    method_name: &str,
    args: Vec<AnyRef>,
) -> Result<AnyRef, BridgeError> {
    let CallContext { runtime, state, .. } = ctx;
    let arg_count = args.len();

    if target.runtime() != runtime
        || args.iter().any(|arg| arg.origin().is_some_and(|origin| origin != runtime))
    {
        return Err(BridgeError::ForeignReference { operation: "invoke a method" });
    }

    let class = target.class().and_then(|class| state.classes.get(class));
    let arities = class.map(|class| method_arities(class, method_name)).unwrap_or_default();
    let (Some(class), false) = (class, arities.is_empty()) else {
        tracing::warn!(%runtime, class = ?target.class(), method = method_name, arg_count, "No such method");
        return Err(BridgeError::MethodNotFound { method_name: method_name.to_string(), arg_count });
    };
    if !arities.contains(&arg_count) {
        let expected = arities.iter().map(usize::to_string).collect::<Vec<_>>().join(" or ");
        return Err(BridgeError::ArityOrType {
            method_name: method_name.to_string(),
            arg_count,
            cause: format!("'{method_name}' takes {expected} argument(s)"),
        });
    }

    // The target's own functions shadow same-named definitions from other scripts.
    let program = state.definitions.merge(class);
    let values: Vec<Dynamic> = args.into_iter().map(AnyRef::into_dynamic).collect();
    let mut this = target.value().clone();
    let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(&mut this);
    let mut scope = Scope::new();
    // Parameters are untyped, so once the arity matches every failure comes from the body.
    state
        .engine
        .call_fn_with_options::<Dynamic>(options, &mut scope, &program, method_name, values)
        .map(|value| AnyRef::from_runtime(runtime, value))
        .map_err(|err| {
            let err =
                BridgeError::Invocation { method_name: method_name.to_string(), arg_count, cause: root_cause(&err) };
            tracing::warn!(%runtime, method = method_name, arg_count, "Invocation failed: {err}");
            err
        })
}

/// Parameter counts of the public functions named `method_name` in one script.
fn method_arities(class: &AST, method_name: &str) -> Vec<usize> {
    if !is_identifier(method_name) {
        return Vec::new();
    }
    let mut arities: Vec<usize> = class
        .iter_functions()
        .filter(|function| function.name == method_name && function.access != FnAccess::Private)
        .map(|function| function.params.len())
        .collect();
    arities.sort_unstable();
    arities.dedup();
    arities
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Engine;

    #[test]
    fn identifiers_exclude_expressions() {
        assert!(is_identifier("save"));
        assert!(is_identifier("_create_annotation2"));
        assert!(!is_identifier("save()"));
        assert!(!is_identifier("2save"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("anon$1f"));
    }

    #[test]
    fn arities_cover_public_overloads_only() {
        let class = Engine::new()
            .compile("fn record(a) {} fn record(a, b) {} private fn record(a, b, c) {} fn other() {}")
            .expect("compile");
        assert_eq!(method_arities(&class, "record"), vec![1, 2]);
        assert!(method_arities(&class, "missing").is_empty());
        assert!(method_arities(&class, "record()").is_empty());
    }
}
