//! Inference over recorded head outputs
//!
//! The recording holds, per image, the proposals that were fed to the network
//! and the head outputs captured at every stage. Images that fail (a missing
//! stage, a row count that no longer matches) are logged and skipped.

use super::{load_config, write_json};
use anyhow::{Context as _, Result};
use cascade_rcnn_core::{
    CascadeConfig, CascadeController, DetectionRecord, ImageInput, RecordedHead, RecordedStage,
};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Args)]
pub struct InferCommand {
    /// Cascade configuration (YAML); the three-stage preset when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Recorded proposals and per-stage head outputs (JSON)
    #[arg(short, long, value_name = "FILE")]
    recording: PathBuf,

    /// Output file for detection records; stdout when omitted
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedImage {
    #[serde(flatten)]
    pub input: ImageInput,
    /// One entry per cascade stage
    pub stages: Vec<RecordedStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub images: Vec<RecordedImage>,
}

impl Recording {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recording {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse recording {}", path.display()))
    }
}

/// Detection records for every image that succeeded, plus the failure count
pub fn detect_records(
    config: CascadeConfig,
    recording: &Recording,
) -> Result<(Vec<DetectionRecord>, usize)> {
    let head = RecordedHead::new(config.num_classes);
    let controller = CascadeController::new(config).context("Invalid cascade configuration")?;

    let batch: Vec<(ImageInput, &[RecordedStage])> = recording
        .images
        .iter()
        .map(|img| (img.input.clone(), img.stages.as_slice()))
        .collect();
    let results = controller.detect_batch(&head, &batch);

    let mut records = Vec::new();
    let mut failed = 0usize;
    for ((image, _), result) in batch.iter().zip(results) {
        match result {
            Ok(detections) => {
                records.extend(detections.iter().map(|d| d.to_record(image.image_id)));
            }
            Err(e) => {
                warn!("Skipping image {}: {}", image.image_id, e);
                failed += 1;
            }
        }
    }
    Ok((records, failed))
}

impl InferCommand {
    pub fn execute(self) -> Result<()> {
        let start = Instant::now();
        let config = load_config(self.config.as_deref())?;
        let recording = Recording::from_file(&self.recording)?;
        let images = recording.images.len();

        let (records, failed) = detect_records(config, &recording)?;
        write_json(&records, self.output.as_deref())?;

        info!(
            "{} detections from {} images ({} skipped) in {:.2?}",
            records.len(),
            images - failed,
            failed,
            start.elapsed()
        );
        Ok(())
    }
}
