use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::host::HostRef;
use crate::loader::SearchPath;
use crate::runtime::{AnyRef, LoadedScript, ObjectRef, RuntimeHandle};

/// Lifecycle of a [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Initializing,
    Loading,
    Ready,
    Operational,
    Released,
    /// The embedded runtime reported its global context as corrupted.
    Failed,
}

impl BridgeState {
    pub fn label(self) -> &'static str {
        match self {
            BridgeState::Uninitialized => "uninitialized",
            BridgeState::Initializing => "initializing",
            BridgeState::Loading => "loading",
            BridgeState::Ready => "ready",
            BridgeState::Operational => "operational",
            BridgeState::Released => "released",
            BridgeState::Failed => "failed",
        }
    }
}

struct Inner {
    runtime: RuntimeHandle,
    state: BridgeState,
}

impl Inner {
    fn transition(&mut self, next: BridgeState) {
        tracing::debug!(runtime = %self.runtime.id(), from = self.state.label(), to = next.label(), "Bridge state change");
        self.state = next;
    }

    /// Moves to `Failed` when a call reports the runtime as unusable.
    fn observe<T>(&mut self, result: Result<T, BridgeError>) -> Result<T, BridgeError> {
        if let Err(BridgeError::RuntimeFailed { .. }) = &result {
            if self.state != BridgeState::Failed {
                self.transition(BridgeState::Failed);
            }
        }
        result
    }
}

/// Host-facing facade over one embedded runtime: loads the configured scripts,
/// resolves the configured singleton references once, then serializes calls.
pub struct Bridge {
    inner: Mutex<Inner>,
    references: HashMap<String, ObjectRef>,
}

impl Bridge {
    /// Builds a bridge from the bundled scripts and references.
    pub fn with_defaults() -> Result<Self, BridgeError> {
        Self::create(&BridgeConfig::default())
    }

    pub fn create(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Self::create_with_search_path(config, SearchPath::from_config(&config.search_path))
    }

    /// Like [`Bridge::create`], with script sources supplied by the caller.
    pub fn create_with_search_path(config: &BridgeConfig, search_path: SearchPath) -> Result<Self, BridgeError> {
        tracing::debug!(from = BridgeState::Uninitialized.label(), to = BridgeState::Initializing.label(), "Bridge state change");
        let runtime = RuntimeHandle::create(&config.runtime, search_path)?;
        let mut inner = Inner { runtime, state: BridgeState::Initializing };

        // Dropping `inner` on any error below releases the partially built runtime.
        inner.transition(BridgeState::Loading);
        for script_id in &config.scripts {
            inner.runtime.load(script_id)?;
        }

        inner.transition(BridgeState::Ready);
        let mut references = HashMap::with_capacity(config.references.len());
        for reference in &config.references {
            let object = inner.runtime.resolve(&reference.expression)?;
            references.insert(reference.name.clone(), object);
        }

        inner.transition(BridgeState::Operational);
        Ok(Self { inner: Mutex::new(inner), references })
    }

    pub fn state(&self) -> BridgeState {
        self.inner.lock().state
    }

    pub fn reference(&self, name: &str) -> Option<&ObjectRef> {
        self.references.get(name)
    }

    pub fn reference_names(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(String::as_str)
    }

    pub fn loaded_scripts(&self) -> Vec<LoadedScript> {
        self.inner.lock().runtime.loaded_scripts()
    }

    /// Saves `object` through the `database` reference; the database assigns its identifier.
    pub fn save(&self, object: &HostRef) -> Result<(), BridgeError> {
        self.invoke(BridgeConfig::DATABASE, "save", vec![AnyRef::from(object)]).map(|_| ())
    }

    /// Creates `annotation` in the database, attached to the already saved `hook`.
    pub fn create_annotation(&self, hook: &HostRef, annotation: &HostRef) -> Result<AnyRef, BridgeError> {
        self.invoke(BridgeConfig::FACADE, "create_annotation", vec![AnyRef::from(hook), AnyRef::from(annotation)])
    }

    /// Calls `method_name` on the named reference.
    pub fn invoke(&self, target_name: &str, method_name: &str, args: Vec<AnyRef>) -> Result<AnyRef, BridgeError> {
        let target = self
            .references
            .get(target_name)
            .ok_or_else(|| BridgeError::UnknownTarget { target_name: target_name.to_string() })?;
        self.invoke_ref(target, method_name, args)
    }

    pub fn invoke_ref(&self, target: &ObjectRef, method_name: &str, args: Vec<AnyRef>) -> Result<AnyRef, BridgeError> {
        let mut inner = self.inner.lock();
        let result = inner.runtime.invoke(target, method_name, args);
        inner.observe(result)
    }

    pub fn resolve(&self, expression: &str) -> Result<ObjectRef, BridgeError> {
        let mut inner = self.inner.lock();
        let result = inner.runtime.resolve(expression);
        inner.observe(result)
    }

    /// Registers host functions on the embedded engine; see [`RuntimeHandle::extend_engine`].
    pub fn extend_engine(&self, extend: impl FnOnce(&mut rhai::Engine)) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        let result = inner.runtime.extend_engine(extend);
        inner.observe(result)
    }

    /// Loads an additional script into the running bridge.
    pub fn load(&self, script_id: &str) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        let result = inner.runtime.load(script_id);
        inner.observe(result)
    }

    /// Releases the embedded runtime. Further calls fail with `UseAfterRelease`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BridgeState::Released {
            return;
        }
        inner.runtime.release();
        inner.transition(BridgeState::Released);
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Bridge")
            .field("state", &inner.state)
            .field("runtime", &inner.runtime)
            .field("references", &self.references.keys().collect::<Vec<_>>())
            .finish()
    }
}
