use anyhow::{Context as _, Result};
use cascade_rcnn_core::CascadeConfig;
use clap::{Args, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// Three stages at IoU 0.5 / 0.6 / 0.7
    Default,
    /// Two stages at IoU 0.5 / 0.7
    TwoStage,
}

impl Preset {
    #[must_use]
    pub fn config(self) -> CascadeConfig {
        match self {
            Preset::Default => CascadeConfig::default(),
            Preset::TwoStage => CascadeConfig::two_stage(),
        }
    }
}

#[derive(Args)]
pub struct ConfigCommand {
    /// Preset to print
    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,
}

impl ConfigCommand {
    pub fn execute(self) -> Result<()> {
        let yaml = self
            .preset
            .config()
            .to_yaml()
            .context("Failed to serialize preset")?;
        print!("{yaml}");
        Ok(())
    }
}
