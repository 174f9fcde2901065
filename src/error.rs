use rhai::EvalAltResult;

/// Failures surfaced by the bridge. Every variant carries the script id,
/// expression or method name it was raised for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Embedded runtime could not start: {reason}")]
    RuntimeInit { reason: String },

    #[error("Script '{script_id}' not found on the search path")]
    ScriptNotFound { script_id: String },

    #[error("Script '{script_id}' could not be read from {path}: {cause}")]
    ScriptRead { script_id: String, path: String, cause: String },

    #[error("Script '{script_id}' failed to parse: {cause}")]
    ScriptParse { script_id: String, cause: String },

    #[error("Script '{script_id}' failed while executing: {cause}")]
    ScriptExecution { script_id: String, cause: String },

    #[error("Expression '{expression}' could not be resolved: {cause}")]
    Resolution { expression: String, cause: String },

    #[error("No method '{method_name}' accepting {arg_count} argument(s) on target")]
    MethodNotFound { method_name: String, arg_count: usize },

    #[error("Call to '{method_name}' with {arg_count} argument(s) rejected: {cause}")]
    ArityOrType { method_name: String, arg_count: usize, cause: String },

    #[error("Method '{method_name}' with {arg_count} argument(s) failed: {cause}")]
    Invocation { method_name: String, arg_count: usize, cause: String },

    #[error("Cannot {operation}: the runtime handle has been released")]
    UseAfterRelease { operation: &'static str },

    #[error("Cannot {operation}: reference belongs to a different runtime")]
    ForeignReference { operation: &'static str },

    #[error("Unknown bridge target '{target_name}'")]
    UnknownTarget { target_name: String },

    #[error("Embedded runtime is unusable: {reason}")]
    RuntimeFailed { reason: String },
}

impl BridgeError {
    /// Per-call failures that leave the bridge usable for later calls.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::MethodNotFound { .. }
                | BridgeError::ArityOrType { .. }
                | BridgeError::Invocation { .. }
                | BridgeError::ForeignReference { .. }
                | BridgeError::UnknownTarget { .. }
        )
    }
}

/// A runtime value could not be converted into the requested host type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Expected {expected}, found {actual}")]
pub struct UnwrapError {
    pub expected: &'static str,
    pub actual: String,
}

/// Message of the innermost error, skipping the function-call wrappers Rhai
/// adds for each script frame.
pub(crate) fn root_cause(err: &EvalAltResult) -> String {
    let mut current = err;
    while let EvalAltResult::ErrorInFunctionCall(_, _, inner, _) = current {
        current = inner.as_ref();
    }
    match current {
        EvalAltResult::ErrorRuntime(value, _) => {
            let value = value.clone().flatten();
            if value.is_string() {
                value.into_string().unwrap_or_default()
            } else {
                value.to_string()
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::{Dynamic, Position};

    #[test]
    fn root_cause_unwraps_nested_calls() {
        let thrown = EvalAltResult::ErrorRuntime(Dynamic::from("hook has no identifier"), Position::NONE);
        let outer = EvalAltResult::ErrorInFunctionCall(
            "create_annotation".into(),
            String::new(),
            Box::new(EvalAltResult::ErrorInFunctionCall(
                "check".into(),
                String::new(),
                Box::new(thrown),
                Position::NONE,
            )),
            Position::NONE,
        );
        assert_eq!(root_cause(&outer), "hook has no identifier");
    }

    #[test]
    fn per_call_failures_are_recoverable() {
        let invocation =
            BridgeError::Invocation { method_name: "save".into(), arg_count: 1, cause: "boom".into() };
        assert!(invocation.is_recoverable());
        let parse = BridgeError::ScriptParse { script_id: "a/b".into(), cause: "eof".into() };
        assert!(!parse.is_recoverable());
        assert!(!BridgeError::UseAfterRelease { operation: "invoke" }.is_recoverable());
    }

    #[test]
    fn messages_carry_context() {
        let err = BridgeError::Invocation { method_name: "save".into(), arg_count: 2, cause: "boom".into() };
        let text = err.to_string();
        assert!(text.contains("save") && text.contains('2') && text.contains("boom"));
    }
}
