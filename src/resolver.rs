use rhai::Dynamic;

use crate::config::VariableBehavior;
use crate::error::{root_cause, BridgeError};
use crate::runtime::{CallContext, ObjectRef};

pub(crate) fn resolve(ctx: CallContext<'_>, expression: &str) -> Result<ObjectRef, BridgeError> {
    let CallContext { runtime, variables, state, .. } = ctx;
    let failure = |cause: String| BridgeError::Resolution { expression: expression.to_string(), cause };

    let unit = state.engine.compile(expression).map_err(|err| failure(err.to_string()))?;
    let program = state.definitions.merge(&unit);

    let checkpoint = state.globals.len();
    let result = state.engine.eval_ast_with_scope::<Dynamic>(&mut state.globals, &program);
    if variables == VariableBehavior::Transient {
        state.globals.rewind(checkpoint);
    }
    let value = result.map_err(|err| failure(root_cause(&err)))?;

    if value.is_unit() {
        return Err(failure("expression produced no value".to_string()));
    }
    let class = state.registry.class_of(&value);
    let object = ObjectRef::new(runtime, class, value);
    tracing::debug!(%runtime, expression, kind = %object.type_name(), class = ?object.class(), "Resolved object reference");
    Ok(object)
}
