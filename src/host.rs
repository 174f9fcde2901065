use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rhai::{Dynamic, Engine, EvalAltResult, Position};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const IDENTIFIER_ATTRIBUTE: &str = "identifier";

/// Plain data holder owned by the host: a class name plus an attribute bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostObject {
    pub class_name: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl HostObject {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self { class_name: class_name.into(), attributes: Map::new() }
    }

    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(attribute.into(), value.into());
    }

    /// Database identifier, if one has been assigned.
    pub fn identifier(&self) -> Option<i64> {
        self.attributes.get(IDENTIFIER_ATTRIBUTE).and_then(Value::as_i64)
    }
}

/// Shared handle to a [`HostObject`]. Clones point at the same object, which is
/// how host objects cross into the embedded runtime by reference.
#[derive(Clone, Default)]
pub struct HostRef(Arc<RwLock<HostObject>>);

impl HostRef {
    pub fn new(object: HostObject) -> Self {
        Self(Arc::new(RwLock::new(object)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HostObject> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, HostObject> {
        self.0.write()
    }

    pub fn snapshot(&self) -> HostObject {
        self.0.read().clone()
    }

    pub fn identifier(&self) -> Option<i64> {
        self.0.read().identifier()
    }

    pub fn ptr_eq(&self, other: &HostRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn script_get(&mut self, attribute: &str) -> Result<Dynamic, Box<EvalAltResult>> {
        match self.0.read().attributes.get(attribute) {
            Some(value) => rhai::serde::to_dynamic(value),
            None => Ok(Dynamic::UNIT),
        }
    }

    fn script_set(&mut self, attribute: &str, value: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let value = to_json(attribute, value)?;
        self.0.write().attributes.insert(attribute.to_string(), value);
        Ok(())
    }

    fn script_has(&mut self, attribute: &str) -> bool {
        self.0.read().attributes.get(attribute).is_some_and(|value| !value.is_null())
    }

    fn script_remove(&mut self, attribute: &str) -> Result<Dynamic, Box<EvalAltResult>> {
        match self.0.write().attributes.remove(attribute) {
            Some(value) => rhai::serde::to_dynamic(&value),
            None => Ok(Dynamic::UNIT),
        }
    }

    fn script_identifier(&mut self) -> Dynamic {
        match self.identifier() {
            Some(id) => Dynamic::from(id),
            None => Dynamic::UNIT,
        }
    }

    fn script_set_identifier(&mut self, value: Dynamic) -> Result<(), Box<EvalAltResult>> {
        self.script_set(IDENTIFIER_ATTRIBUTE, value)
    }
}

impl From<HostObject> for HostRef {
    fn from(object: HostObject) -> Self {
        Self::new(object)
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostRef").field(&*self.0.read()).finish()
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object = self.0.read();
        match object.identifier() {
            Some(id) => write!(f, "{}@{id}", object.class_name),
            None => write!(f, "{}@new", object.class_name),
        }
    }
}

fn to_json(attribute: &str, value: Dynamic) -> Result<Value, Box<EvalAltResult>> {
    let value = value.flatten();
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Some(host) = value.clone().try_cast::<HostRef>() {
        // Nested host references are stored by value; the attribute bag is plain data.
        return serde_json::to_value(host.snapshot()).map_err(|err| {
            Box::new(EvalAltResult::ErrorSystem(format!("attribute '{attribute}'"), err.into()))
        });
    }
    let type_name = value.type_name();
    rhai::serde::from_dynamic::<Value>(&value).map_err(|_| {
        Box::new(EvalAltResult::ErrorMismatchDataType(
            "plain data".to_string(),
            format!("{type_name} for attribute '{attribute}'"),
            Position::NONE,
        ))
    })
}

/// Exposes `HostObject` to scripts.
pub(crate) fn register_host_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<HostRef>("HostObject")
        .register_fn("get", HostRef::script_get)
        .register_fn("set", HostRef::script_set)
        .register_fn("has", HostRef::script_has)
        .register_fn("remove", HostRef::script_remove)
        .register_get("class_name", |object: &mut HostRef| object.read().class_name.clone())
        .register_get_set("identifier", HostRef::script_identifier, HostRef::script_set_identifier)
        .register_fn("to_string", |object: &mut HostRef| object.to_string())
        .register_fn("to_debug", |object: &mut HostRef| format!("{object:?}"));
}
