use crate::config::{BridgeConfigOverrides, VariableBehavior};
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

const FLAGS: [&str; 5] = ["config", "script-root", "max-operations", "variables", "save"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    script_roots: Vec<PathBuf>,
    max_operations: Option<u64>,
    variables: Option<VariableBehavior>,
    save: Option<PathBuf>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    /// Parses `--name <value>` or `--name=value` pairs. The program name comes first
    /// and is skipped. A repeated flag overrides the earlier one, except `--script-root`,
    /// which accumulates.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rest = args.into_iter().skip(1).map(|arg| arg.as_ref().to_owned());
        let mut overrides = CliOverrides::default();
        while let Some(arg) = rest.next() {
            let Some(flag) = arg.strip_prefix("--") else {
                bail!("Unexpected argument '{arg}'. Flags take the form --name <value>.");
            };
            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name, Some(value.to_owned())),
                None => (flag, None),
            };
            if !FLAGS.contains(&name) {
                bail!("Unknown flag '--{name}'. Supported flags: {}.", FLAGS.map(|flag| format!("--{flag}")).join(", "));
            }
            let value = match inline {
                Some(value) => value,
                None => rest.next().ok_or_else(|| anyhow!("Expected a value after '--{name}'"))?,
            };
            overrides.apply(name, value)?;
        }
        Ok(overrides)
    }

    fn apply(&mut self, name: &str, value: String) -> Result<()> {
        match name {
            "config" => self.config = Some(value.into()),
            "script-root" => self.script_roots.push(value.into()),
            "max-operations" => {
                let budget = value.parse::<u64>().with_context(|| format!("Invalid max-operations '{value}'"))?;
                self.max_operations = Some(budget);
            }
            "variables" => {
                let behavior = VariableBehavior::parse(&value)
                    .ok_or_else(|| anyhow!("Invalid variables value '{value}'. Use transient or persistent."))?;
                self.variables = Some(behavior);
            }
            "save" => self.save = Some(value.into()),
            _ => bail!("Unknown flag '--{name}'"),
        }
        Ok(())
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn save_path(&self) -> Option<&PathBuf> {
        self.save.as_ref()
    }

    pub fn to_config_overrides(&self) -> BridgeConfigOverrides {
        BridgeConfigOverrides {
            script_roots: self.script_roots.clone(),
            max_operations: self.max_operations,
            variables: self.variables,
        }
    }
}
