use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, NativeCallContext, Scope, AST};
use serde::de::DeserializeOwned;

use crate::config::{RuntimeConfig, VariableBehavior};
use crate::error::{BridgeError, UnwrapError};
use crate::host::{register_host_api, HostRef};
use crate::loader::SearchPath;
use crate::{dispatch, loader, resolver};

/// Process-unique identity of a runtime handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeId(u64);

impl RuntimeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleStatus {
    Live,
    /// A call panicked inside the engine; the global context can no longer be trusted.
    Failed(String),
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedScript {
    pub script_id: String,
    pub origin: String,
    pub digest: String,
    pub loads: usize,
}

/// Handle to a live object inside the embedded runtime, valid only with the
/// runtime that produced it.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    runtime: RuntimeId,
    class: Option<String>,
    value: Dynamic,
}

impl ObjectRef {
    pub(crate) fn new(runtime: RuntimeId, class: Option<String>, value: Dynamic) -> Self {
        Self { runtime, class, value: value.into_shared() }
    }

    pub fn runtime(&self) -> RuntimeId {
        self.runtime
    }

    /// Script id whose public functions are this object's methods. Objects not
    /// handed out by `singleton` have none.
    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn type_name(&self) -> String {
        self.value.clone().flatten().type_name().to_string()
    }

    pub fn to_any(&self) -> AnyRef {
        AnyRef { origin: Some(self.runtime), value: self.value.clone() }
    }

    pub(crate) fn value(&self) -> &Dynamic {
        &self.value
    }
}

/// Any value crossing the boundary: host objects and primitives going in,
/// results coming out.
#[derive(Debug, Clone)]
pub struct AnyRef {
    origin: Option<RuntimeId>,
    value: Dynamic,
}

impl AnyRef {
    pub fn unit() -> Self {
        Self { origin: None, value: Dynamic::UNIT }
    }

    pub(crate) fn from_runtime(runtime: RuntimeId, value: Dynamic) -> Self {
        Self { origin: Some(runtime), value }
    }

    pub fn origin(&self) -> Option<RuntimeId> {
        self.origin
    }

    pub(crate) fn into_dynamic(self) -> Dynamic {
        self.value
    }

    fn flat(&self) -> Dynamic {
        self.value.clone().flatten()
    }

    pub fn is_unit(&self) -> bool {
        self.flat().is_unit()
    }

    pub fn type_name(&self) -> String {
        self.flat().type_name().to_string()
    }

    pub fn into_host(self) -> Result<HostRef, UnwrapError> {
        let value = self.value.flatten();
        let actual = value.type_name().to_string();
        value.try_cast::<HostRef>().ok_or(UnwrapError { expected: "HostObject", actual })
    }

    pub fn as_int(&self) -> Result<i64, UnwrapError> {
        let value = self.flat();
        value.as_int().map_err(|actual| UnwrapError { expected: "integer", actual: actual.to_string() })
    }

    pub fn as_bool(&self) -> Result<bool, UnwrapError> {
        let value = self.flat();
        value.as_bool().map_err(|actual| UnwrapError { expected: "boolean", actual: actual.to_string() })
    }

    pub fn into_string(self) -> Result<String, UnwrapError> {
        self.value
            .flatten()
            .into_string()
            .map_err(|actual| UnwrapError { expected: "string", actual: actual.to_string() })
    }

    /// Converts plain runtime data (maps, arrays, primitives) into a host type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, UnwrapError> {
        let value = self.flat();
        rhai::serde::from_dynamic::<T>(&value).map_err(|err| UnwrapError {
            expected: std::any::type_name::<T>(),
            actual: format!("{} ({err})", value.type_name()),
        })
    }
}

impl From<HostRef> for AnyRef {
    fn from(object: HostRef) -> Self {
        Self { origin: None, value: Dynamic::from(object) }
    }
}

impl From<&HostRef> for AnyRef {
    fn from(object: &HostRef) -> Self {
        Self::from(object.clone())
    }
}

impl From<&ObjectRef> for AnyRef {
    fn from(object: &ObjectRef) -> Self {
        object.to_any()
    }
}

impl From<ObjectRef> for AnyRef {
    fn from(object: ObjectRef) -> Self {
        Self { origin: Some(object.runtime), value: object.value }
    }
}

impl From<i64> for AnyRef {
    fn from(value: i64) -> Self {
        Self { origin: None, value: Dynamic::from(value) }
    }
}

impl From<bool> for AnyRef {
    fn from(value: bool) -> Self {
        Self { origin: None, value: Dynamic::from(value) }
    }
}

impl From<&str> for AnyRef {
    fn from(value: &str) -> Self {
        Self { origin: None, value: Dynamic::from(value.to_string()) }
    }
}

impl From<String> for AnyRef {
    fn from(value: String) -> Self {
        Self { origin: None, value: Dynamic::from(value) }
    }
}

/// Singletons handed out by the script-side `singleton(name, init)` function.
#[derive(Clone, Default)]
pub(crate) struct SingletonTable(Arc<Mutex<HashMap<String, Dynamic>>>);

impl SingletonTable {
    fn get(&self, name: &str) -> Option<Dynamic> {
        self.0.lock().get(name).cloned()
    }

    /// Keeps the first value stored under `name` if an initializer raced ahead.
    fn insert_if_absent(&self, name: &str, value: Dynamic) -> Dynamic {
        self.0.lock().entry(name.to_string()).or_insert(value).clone()
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Which script defines each function, and the tag marking values of each class.
#[derive(Default)]
struct ClassIndex {
    owners: HashMap<String, String>,
    tags: Vec<String>,
}

/// Shared between the loader, which records definitions, and the script-side
/// `singleton` function, which tags the values it creates.
#[derive(Clone, Default)]
pub(crate) struct ClassRegistry(Arc<RwLock<ClassIndex>>);

impl ClassRegistry {
    /// Records every function of a freshly loaded script, closures included.
    pub(crate) fn record(&self, script_id: &str, unit: &AST) {
        let mut index = self.0.write();
        for function in unit.iter_functions() {
            index.owners.insert(function.name.to_string(), script_id.to_string());
        }
    }

    fn tag_for_function(&self, fn_name: &str) -> Option<usize> {
        let mut index = self.0.write();
        let class = index.owners.get(fn_name)?.clone();
        if let Some(position) = index.tags.iter().position(|known| *known == class) {
            return Some(position + 1);
        }
        index.tags.push(class);
        Some(index.tags.len())
    }

    /// Class of a value tagged by `singleton`, looking through shared wrappers.
    pub(crate) fn class_of(&self, value: &Dynamic) -> Option<String> {
        let tag = match usize::try_from(value.tag()) {
            Ok(0) | Err(_) => usize::try_from(value.clone().flatten().tag()).ok()?,
            Ok(tag) => tag,
        };
        self.0.read().tags.get(tag.checked_sub(1)?).cloned()
    }

    fn clear(&self) {
        let mut index = self.0.write();
        index.owners.clear();
        index.tags.clear();
    }
}

pub(crate) struct EngineState {
    pub(crate) engine: Engine,
    /// Function definitions accumulated from every successful load.
    pub(crate) definitions: AST,
    /// Functions of the latest successful load of each script, keyed by script id.
    pub(crate) classes: HashMap<String, AST>,
    pub(crate) registry: ClassRegistry,
    pub(crate) globals: Scope<'static>,
    pub(crate) loaded: Vec<LoadedScript>,
    singletons: SingletonTable,
}

/// Borrowed view of a live handle for the duration of one call.
pub(crate) struct CallContext<'a> {
    pub(crate) runtime: RuntimeId,
    pub(crate) variables: VariableBehavior,
    pub(crate) search_path: &'a SearchPath,
    pub(crate) state: &'a mut EngineState,
}

/// Exclusive owner of one embedded Rhai engine and its global state.
pub struct RuntimeHandle {
    id: RuntimeId,
    variables: VariableBehavior,
    search_path: SearchPath,
    status: HandleStatus,
    state: Option<EngineState>,
}

impl RuntimeHandle {
    pub fn create(config: &RuntimeConfig, search_path: SearchPath) -> Result<Self, BridgeError> {
        if config.max_call_levels == 0 {
            return Err(BridgeError::RuntimeInit { reason: "max_call_levels must be at least 1".to_string() });
        }
        search_path.verify().map_err(|reason| BridgeError::RuntimeInit { reason })?;

        let id = RuntimeId::next();
        let singletons = SingletonTable::default();
        let registry = ClassRegistry::default();
        let engine = build_engine(config, singletons.clone(), registry.clone());
        tracing::info!(runtime = %id, variables = config.variables.label(), search_path = ?search_path, "Embedded runtime created");
        Ok(Self {
            id,
            variables: config.variables,
            search_path,
            status: HandleStatus::Live,
            state: Some(EngineState {
                engine,
                definitions: AST::empty(),
                classes: HashMap::new(),
                registry,
                globals: Scope::new(),
                loaded: Vec::new(),
                singletons,
            }),
        })
    }

    pub fn id(&self) -> RuntimeId {
        self.id
    }

    pub fn status(&self) -> &HandleStatus {
        &self.status
    }

    pub fn is_released(&self) -> bool {
        self.status == HandleStatus::Released
    }

    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    pub fn loaded_scripts(&self) -> Vec<LoadedScript> {
        self.state.as_ref().map(|state| state.loaded.clone()).unwrap_or_default()
    }

    pub fn singleton_count(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.singletons.len())
    }

    /// Resolves `script_id` on the search path and runs it once.
    pub fn load(&mut self, script_id: &str) -> Result<(), BridgeError> {
        self.run("load a script", |ctx| loader::load(ctx, script_id))
    }

    /// Evaluates `expression` in the global context and keeps the result as a reference.
    pub fn resolve(&mut self, expression: &str) -> Result<ObjectRef, BridgeError> {
        self.run("resolve an object", |ctx| resolver::resolve(ctx, expression))
    }

    /// Registers additional host functions on the engine, e.g. native helpers
    /// the loaded scripts call.
    pub fn extend_engine(&mut self, extend: impl FnOnce(&mut Engine)) -> Result<(), BridgeError> {
        self.run("extend the engine", |ctx| {
            extend(&mut ctx.state.engine);
            Ok(())
        })
    }

    pub fn invoke(
        &mut self,
        target: &ObjectRef,
        method_name: &str,
        args: Vec<AnyRef>,
    ) -> Result<AnyRef, BridgeError> {
        self.run("invoke a method", |ctx| dispatch::invoke(ctx, target, method_name, args))
    }

    /// Tears the engine down. Calling it again does nothing.
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            state.singletons.clear();
            state.registry.clear();
            drop(state);
            tracing::info!(runtime = %self.id, "Embedded runtime released");
        }
        self.status = HandleStatus::Released;
    }

    fn run<T>(
        &mut self,
        operation: &'static str,
        call: impl FnOnce(CallContext<'_>) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        match &self.status {
            HandleStatus::Live => {}
            HandleStatus::Released => return Err(BridgeError::UseAfterRelease { operation }),
            HandleStatus::Failed(reason) => return Err(BridgeError::RuntimeFailed { reason: reason.clone() }),
        }
        let Some(state) = self.state.as_mut() else {
            return Err(BridgeError::UseAfterRelease { operation });
        };
        let ctx = CallContext { runtime: self.id, variables: self.variables, search_path: &self.search_path, state };
        match panic::catch_unwind(AssertUnwindSafe(|| call(ctx))) {
            Ok(result) => result,
            Err(payload) => {
                let reason = format!("panic during {operation}: {}", panic_message(payload.as_ref()));
                tracing::error!(runtime = %self.id, "{reason}");
                self.status = HandleStatus::Failed(reason.clone());
                Err(BridgeError::RuntimeFailed { reason })
            }
        }
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("search_path", &self.search_path)
            .finish()
    }
}

fn build_engine(config: &RuntimeConfig, singletons: SingletonTable, registry: ClassRegistry) -> Engine {
    let mut engine = Engine::new();
    engine.set_fast_operators(true);
    engine.set_max_operations(config.max_operations);
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);
    engine.set_strict_variables(config.strict_variables);
    engine.on_print(|text| tracing::info!(target: "tissue_bridge::script", "{text}"));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "tissue_bridge::script", source = source.unwrap_or("-"), %pos, "{text}")
    });
    register_host_api(&mut engine);
    register_singleton_api(&mut engine, singletons, registry);
    engine
}

/// A singleton belongs to the script that defines its initializer.
fn register_singleton_api(engine: &mut Engine, singletons: SingletonTable, registry: ClassRegistry) {
    engine.register_fn(
        "singleton",
        move |context: NativeCallContext, name: &str, init: FnPtr| -> Result<Dynamic, Box<EvalAltResult>> {
            if let Some(existing) = singletons.get(name) {
                return Ok(existing);
            }
            // The table lock is not held while `init` runs so it may request other singletons.
            let mut value: Dynamic = init.call_within_context(&context, ())?;
            let tag = registry.tag_for_function(init.fn_name()).and_then(|tag| tag.try_into().ok());
            if let Some(tag) = tag {
                value.set_tag(tag);
            }
            let mut shared = value.into_shared();
            if let Some(tag) = tag {
                shared.set_tag(tag);
            }
            Ok(singletons.insert_if_absent(name, shared))
        },
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::EmbeddedSource;

    fn handle_with(scripts: EmbeddedSource) -> RuntimeHandle {
        RuntimeHandle::create(&RuntimeConfig::default(), SearchPath::new().with(scripts)).expect("runtime")
    }

    #[test]
    fn ids_are_unique_per_handle() {
        let first = handle_with(EmbeddedSource::new());
        let second = handle_with(EmbeddedSource::new());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn empty_search_path_is_an_init_error() {
        let err = RuntimeHandle::create(&RuntimeConfig::default(), SearchPath::new()).unwrap_err();
        assert!(matches!(err, BridgeError::RuntimeInit { .. }));
    }

    #[test]
    fn zero_call_levels_is_an_init_error() {
        let config = RuntimeConfig { max_call_levels: 0, ..RuntimeConfig::default() };
        let err = RuntimeHandle::create(&config, SearchPath::new().with(EmbeddedSource::bundled())).unwrap_err();
        assert!(matches!(err, BridgeError::RuntimeInit { .. }));
    }

    #[test]
    fn release_is_idempotent() {
        let mut handle = handle_with(EmbeddedSource::bundled());
        handle.release();
        handle.release();
        assert!(handle.is_released());
        assert!(handle.loaded_scripts().is_empty());
    }

    #[test]
    fn singletons_are_created_once() {
        let mut handle = handle_with(EmbeddedSource::new().with(
            "lab/counter",
            r#"
                fn counter() { singleton("counter", || #{ hits: 0 }) }
                fn hit() { this.hits += 1; this.hits }
            "#,
        ));
        handle.load("lab/counter").expect("load");
        let first = handle.resolve("counter()").expect("first resolve");
        let second = handle.resolve("counter()").expect("second resolve");
        handle.invoke(&first, "hit", Vec::new()).expect("hit through first");
        let hits = handle.invoke(&second, "hit", Vec::new()).expect("hit through second");
        assert_eq!(hits.as_int(), Ok(2));
        assert_eq!(handle.singleton_count(), 1);
    }

    #[test]
    fn unwrap_reports_actual_type() {
        let value = AnyRef::from("label");
        let err = value.as_int().unwrap_err();
        assert_eq!(err.expected, "integer");
        assert_eq!(AnyRef::from(5_i64).as_int(), Ok(5));
        assert!(AnyRef::unit().is_unit());
    }
}
