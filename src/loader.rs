use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rhai::Scope;

use crate::config::SearchPathConfig;
use crate::error::{root_cause, BridgeError};
use crate::runtime::{CallContext, LoadedScript};

pub const SCRIPT_EXTENSION: &str = "rhai";

const BUNDLED_SCRIPTS: &[(&str, &str)] = &[
    ("catissue/database", include_str!("../scripts/catissue/database.rhai")),
    ("catissue/embed/jbridge", include_str!("../scripts/catissue/embed/jbridge.rhai")),
];

/// Source text located for a script id, with a description of where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptResource {
    pub script_id: String,
    pub origin: String,
    pub source: String,
}

/// A place script resources can be looked up in.
pub trait ScriptSource: Send + Sync {
    /// `script_id` is already normalized: `/`-separated segments without extension.
    /// `Ok(None)` means this source does not hold the script.
    fn locate(&self, script_id: &str) -> Result<Option<ScriptResource>, BridgeError>;

    fn describe(&self) -> String;

    /// Checked once when a runtime is created.
    fn verify(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Resources compiled into the binary.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSource {
    resources: BTreeMap<String, String>,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scripts shipped with the crate.
    pub fn bundled() -> Self {
        let mut source = Self::new();
        for (script_id, text) in BUNDLED_SCRIPTS {
            source.insert(*script_id, *text);
        }
        source
    }

    pub fn insert(&mut self, script_id: impl Into<String>, text: impl Into<String>) {
        self.resources.insert(script_id.into(), text.into());
    }

    pub fn with(mut self, script_id: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(script_id, text);
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}

impl ScriptSource for EmbeddedSource {
    fn locate(&self, script_id: &str) -> Result<Option<ScriptResource>, BridgeError> {
        Ok(self.resources.get(script_id).map(|text| ScriptResource {
            script_id: script_id.to_string(),
            origin: format!("embedded:{script_id}"),
            source: text.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("embedded ({} scripts)", self.resources.len())
    }
}

/// `<root>/<script id>.rhai` on disk.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, script_id: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in script_id.split('/') {
            path.push(segment);
        }
        path.set_extension(SCRIPT_EXTENSION);
        path
    }
}

impl ScriptSource for DirectorySource {
    fn locate(&self, script_id: &str) -> Result<Option<ScriptResource>, BridgeError> {
        let path = self.path_for(script_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(BridgeError::ScriptRead {
                    script_id: script_id.to_string(),
                    path: path.display().to_string(),
                    cause: err.to_string(),
                })
            }
        };
        let source = String::from_utf8(bytes).map_err(|err| BridgeError::ScriptParse {
            script_id: script_id.to_string(),
            cause: format!("{} is not valid UTF-8: {err}", path.display()),
        })?;
        Ok(Some(ScriptResource { script_id: script_id.to_string(), origin: path.display().to_string(), source }))
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn verify(&self) -> Result<(), String> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(format!("script root {} is not a directory", self.root.display()))
        }
    }
}

/// Ordered list of script sources; the first source holding an id wins.
#[derive(Default)]
pub struct SearchPath {
    sources: Vec<Box<dyn ScriptSource>>,
}

impl SearchPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SearchPathConfig) -> Self {
        let mut search_path = Self::new();
        for root in &config.roots {
            search_path.push(DirectorySource::new(root));
        }
        if config.embedded {
            search_path.push(EmbeddedSource::bundled());
        }
        search_path
    }

    pub fn push(&mut self, source: impl ScriptSource + 'static) {
        self.sources.push(Box::new(source));
    }

    pub fn with(mut self, source: impl ScriptSource + 'static) -> Self {
        self.push(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn verify(&self) -> Result<(), String> {
        if self.sources.is_empty() {
            return Err("search path has no script sources".to_string());
        }
        self.sources.iter().try_for_each(|source| source.verify())
    }

    /// Stops at the first source that holds the script or fails to read it.
    pub fn locate(&self, script_id: &str) -> Result<Option<ScriptResource>, BridgeError> {
        let Some(normalized) = normalize_script_id(script_id) else {
            return Ok(None);
        };
        for source in &self.sources {
            if let Some(resource) = source.locate(&normalized)? {
                return Ok(Some(resource));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for SearchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.sources.iter().map(|source| source.describe())).finish()
    }
}

/// Canonical form of a logical script id, or `None` if it can never name a resource.
pub fn normalize_script_id(script_id: &str) -> Option<String> {
    let trimmed = script_id.trim();
    let trimmed = trimmed.strip_suffix(".rhai").unwrap_or(trimmed);
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains('\\') {
        return None;
    }
    let valid = trimmed.split('/').all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    valid.then(|| trimmed.to_string())
}

pub(crate) fn load(ctx: CallContext<'_>, script_id: &str) -> Result<(), BridgeError> {
    let CallContext { runtime, search_path, state, .. } = ctx;
    let Some(resource) = search_path.locate(script_id)? else {
        return Err(BridgeError::ScriptNotFound { script_id: script_id.to_string() });
    };

    let mut unit = state.engine.compile(&resource.source).map_err(|err| BridgeError::ScriptParse {
        script_id: script_id.to_string(),
        cause: err.to_string(),
    })?;
    unit.set_source(resource.script_id.as_str());

    // Top-level code sees earlier definitions; its own variables die with this scope.
    let program = state.definitions.merge(&unit);
    let mut scope = Scope::new();
    state.engine.run_ast_with_scope(&mut scope, &program).map_err(|err| BridgeError::ScriptExecution {
        script_id: script_id.to_string(),
        cause: root_cause(&err),
    })?;
    let functions = unit.clone_functions_only();
    state.definitions = state.definitions.merge(&functions);
    state.registry.record(&resource.script_id, &functions);
    state.classes.insert(resource.script_id.clone(), functions);

    let digest = blake3::hash(resource.source.as_bytes()).to_hex().to_string();
    match state.loaded.iter_mut().find(|loaded| loaded.script_id == resource.script_id) {
        Some(loaded) => {
            if loaded.digest != digest {
                tracing::debug!(%runtime, script = %resource.script_id, "Script definitions replaced");
            }
            loaded.origin = resource.origin.clone();
            loaded.digest = digest.clone();
            loaded.loads += 1;
        }
        None => state.loaded.push(LoadedScript {
            script_id: resource.script_id.clone(),
            origin: resource.origin.clone(),
            digest: digest.clone(),
            loads: 1,
        }),
    }
    tracing::info!(%runtime, script = %resource.script_id, origin = %resource.origin, %digest, "Loaded script");
    Ok(())
}
