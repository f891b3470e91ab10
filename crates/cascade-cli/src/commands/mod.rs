pub mod assign;
pub mod config;
pub mod infer;

use anyhow::{Context as _, Result};
use cascade_rcnn_core::CascadeConfig;
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Load and validate a YAML configuration, or fall back to the default preset
pub fn load_config(path: Option<&Path>) -> Result<CascadeConfig> {
    match path {
        Some(path) => {
            let config = CascadeConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!(
                "Loaded {}-stage config from {}",
                config.num_stages(),
                path.display()
            );
            Ok(config)
        }
        None => Ok(CascadeConfig::default()),
    }
}

/// Pretty JSON to `output`, or to stdout when no path is given
pub fn write_json<T: Serialize + ?Sized>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
