use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// How top-level variables declared by resolve expressions are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableBehavior {
    /// Each expression starts from the global scope as it was before the previous one.
    #[default]
    Transient,
    /// Variables declared by one expression stay visible to later ones.
    Persistent,
}

impl VariableBehavior {
    pub fn label(self) -> &'static str {
        match self {
            VariableBehavior::Transient => "transient",
            VariableBehavior::Persistent => "persistent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "transient" => Some(VariableBehavior::Transient),
            "persistent" => Some(VariableBehavior::Persistent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub variables: VariableBehavior,
    /// Operation budget per call; 0 disables the limit.
    #[serde(default)]
    pub max_operations: u64,
    #[serde(default = "RuntimeConfig::default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "RuntimeConfig::default_max_expr_depth")]
    pub max_expr_depth: usize,
    #[serde(default)]
    pub strict_variables: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchPathConfig {
    /// Directory roots consulted in order, before any embedded resources.
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default = "SearchPathConfig::default_embedded")]
    pub embedded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReferenceConfig {
    pub name: String,
    pub expression: String,
}

impl ReferenceConfig {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self { name: name.into(), expression: expression.into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub search_path: SearchPathConfig,
    #[serde(default = "BridgeConfig::default_scripts")]
    pub scripts: Vec<String>,
    #[serde(default = "BridgeConfig::default_references")]
    pub references: Vec<ReferenceConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfigOverrides {
    pub script_roots: Vec<PathBuf>,
    pub max_operations: Option<u64>,
    pub variables: Option<VariableBehavior>,
}

impl RuntimeConfig {
    const fn default_max_call_levels() -> usize {
        64
    }

    const fn default_max_expr_depth() -> usize {
        128
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            variables: VariableBehavior::default(),
            max_operations: 0,
            max_call_levels: Self::default_max_call_levels(),
            max_expr_depth: Self::default_max_expr_depth(),
            strict_variables: false,
        }
    }
}

impl SearchPathConfig {
    const fn default_embedded() -> bool {
        true
    }
}

impl Default for SearchPathConfig {
    fn default() -> Self {
        Self { roots: Vec::new(), embedded: Self::default_embedded() }
    }
}

impl BridgeConfig {
    pub const DATABASE: &'static str = "database";
    pub const FACADE: &'static str = "facade";

    fn default_scripts() -> Vec<String> {
        vec!["catissue/database".to_string(), "catissue/embed/jbridge".to_string()]
    }

    fn default_references() -> Vec<ReferenceConfig> {
        vec![ReferenceConfig::new(Self::DATABASE, "database()"), ReferenceConfig::new(Self::FACADE, "jbridge()")]
    }

    /// Reads a JSON bridge config. Fields missing from the document keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading bridge config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("{} is not a valid bridge config", path.display()))
    }

    /// Like [`BridgeConfig::load`], but an unusable file yields the bundled defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self::load(path).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = ?err, "Bridge config unusable, using bundled defaults");
            Self::default()
        })
    }

    pub fn apply_overrides(&mut self, overrides: &BridgeConfigOverrides) {
        if !overrides.script_roots.is_empty() {
            let mut roots = overrides.script_roots.clone();
            roots.append(&mut self.search_path.roots);
            self.search_path.roots = roots;
        }
        if let Some(max_operations) = overrides.max_operations {
            self.runtime.max_operations = max_operations;
        }
        if let Some(variables) = overrides.variables {
            self.runtime.variables = variables;
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            search_path: SearchPathConfig::default(),
            scripts: Self::default_scripts(),
            references: Self::default_references(),
        }
    }
}

impl BridgeConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.script_roots.is_empty() && self.max_operations.is_none() && self.variables.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if !self.script_roots.is_empty() {
            fields.push("script_roots");
        }
        if self.max_operations.is_some() {
            fields.push("max_operations");
        }
        if self.variables.is_some() {
            fields.push("variables");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_uses_bundled_defaults() {
        let cfg: BridgeConfig = serde_json::from_str("{}").expect("parse config");
        assert_eq!(cfg.scripts, vec!["catissue/database", "catissue/embed/jbridge"]);
        assert_eq!(cfg.references.len(), 2);
        assert_eq!(cfg.references[0], ReferenceConfig::new("database", "database()"));
        assert!(cfg.search_path.embedded);
        assert_eq!(cfg.runtime.variables, VariableBehavior::Transient);
        assert_eq!(cfg.runtime.max_call_levels, 64);
    }

    #[test]
    fn loads_partial_config_from_disk() {
        let mut file = NamedTempFile::new().expect("temp config");
        write!(
            file,
            r#"{{ "runtime": {{ "variables": "persistent", "max_operations": 5000 }},
                 "search_path": {{ "roots": ["scripts"], "embedded": false }} }}"#
        )
        .expect("write config");
        let cfg = BridgeConfig::load(file.path()).expect("load config");
        assert_eq!(cfg.runtime.variables, VariableBehavior::Persistent);
        assert_eq!(cfg.runtime.max_operations, 5000);
        assert_eq!(cfg.search_path.roots, vec![PathBuf::from("scripts")]);
        assert!(!cfg.search_path.embedded);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = BridgeConfig::load_or_default("does/not/exist.json");
        assert_eq!(cfg.references[1].name, BridgeConfig::FACADE);
    }

    #[test]
    fn malformed_file_names_the_path() {
        let mut file = NamedTempFile::new().expect("temp config");
        write!(file, r#"{{ "scripts": 3 }}"#).expect("write config");
        let err = BridgeConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("not a valid bridge config"), "error was {err}");
        let cfg = BridgeConfig::load_or_default(file.path());
        assert_eq!(cfg.scripts, BridgeConfig::default_scripts());
    }

    #[test]
    fn override_roots_take_precedence() {
        let mut cfg = BridgeConfig::default();
        cfg.search_path.roots.push(PathBuf::from("configured"));
        let overrides = BridgeConfigOverrides {
            script_roots: vec![PathBuf::from("cli")],
            max_operations: Some(10),
            variables: None,
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.search_path.roots, vec![PathBuf::from("cli"), PathBuf::from("configured")]);
        assert_eq!(cfg.runtime.max_operations, 10);
        assert_eq!(overrides.applied_fields(), vec!["script_roots", "max_operations"]);
    }
}
