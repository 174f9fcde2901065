use std::fs::File;

use anyhow::{Context, Result};
use tissue_bridge::cli::CliOverrides;
use tissue_bridge::{Bridge, BridgeConfig, HostObject, HostRef};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tissue_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(&cli) {
        eprintln!("Bridge error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: &CliOverrides) -> Result<()> {
    let mut config = match cli.config_path() {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    let overrides = cli.to_config_overrides();
    if !overrides.is_empty() {
        tracing::info!(fields = ?overrides.applied_fields(), "Applying command-line overrides");
        config.apply_overrides(&overrides);
    }

    let bridge = Bridge::create(&config).context("Creating bridge")?;
    for script in bridge.loaded_scripts() {
        tracing::info!(script = %script.script_id, origin = %script.origin, "Script available");
    }

    if let Some(path) = cli.save_path() {
        let file = File::open(path).with_context(|| format!("opening host object '{}'", path.display()))?;
        let object: HostObject = serde_json::from_reader(file).with_context(|| "parsing host object JSON")?;
        let object = HostRef::new(object);
        bridge.save(&object).with_context(|| format!("saving {object}"))?;
        println!("{}", serde_json::to_string_pretty(&object.snapshot())?);
    }

    bridge.close();
    Ok(())
}
