//! Per-stage matching report
//!
//! Matches each image's proposals against its ground truth at every stage
//! threshold, draws that stage's training batch and reports the balance.
//! No head is involved, so every stage sees the same proposal geometry.

use super::{load_config, write_json};
use anyhow::{Context as _, Result};
use cascade_rcnn_core::{
    image_seed, mean_overlap, BBox, CascadeConfig, ImageInput, IouMatcher, StageResampler,
};
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct AssignCommand {
    /// Cascade configuration (YAML); the three-stage preset when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Images with proposals and ground truth (JSON)
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Seed for the resampler
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Output file for the report; stdout when omitted
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignInput {
    pub images: Vec<ImageInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: usize,
    pub iou_threshold: f32,
    pub candidates: usize,
    pub foreground: usize,
    pub background: usize,
    pub sampled_foreground: usize,
    pub sampled_background: usize,
    /// Mean best overlap of the sampled batch
    pub mean_overlap: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReport {
    pub image_id: u64,
    pub stages: Vec<StageReport>,
}

/// Report for one image; proposals are clipped and empties dropped first
pub fn report_image(config: &CascadeConfig, image: &ImageInput, seed: u64) -> Result<ImageReport> {
    image.validate(config.num_classes)?;
    let candidates: Vec<BBox> = image
        .proposals
        .iter()
        .map(|p| p.bbox.clip(image.size))
        .filter(|b| !b.is_empty())
        .collect();
    let mut rng = StdRng::seed_from_u64(image_seed(seed, image.image_id));

    let stages = config
        .stages
        .iter()
        .enumerate()
        .map(|(i, stage)| {
            let matcher = IouMatcher::new(stage.iou_threshold)?;
            let resampler = StageResampler::new(stage.sampling)?;
            let assignments = matcher.assign(&candidates, &image.ground_truth);
            let sampled = resampler.sample(&assignments, &mut rng);
            let foreground = assignments.iter().filter(|a| a.is_foreground()).count();

            Ok(StageReport {
                stage: i,
                iou_threshold: stage.iou_threshold,
                candidates: candidates.len(),
                foreground,
                background: candidates.len() - foreground,
                sampled_foreground: sampled.foreground.len(),
                sampled_background: sampled.background.len(),
                mean_overlap: mean_overlap(&assignments, sampled.iter()),
            })
        })
        .collect::<cascade_rcnn_core::Result<Vec<_>>>()?;

    Ok(ImageReport {
        image_id: image.image_id,
        stages,
    })
}

impl AssignCommand {
    pub fn execute(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let contents = std::fs::read_to_string(&self.input)
            .with_context(|| format!("Failed to read {}", self.input.display()))?;
        let input: AssignInput = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.input.display()))?;

        let reports = input
            .images
            .par_iter()
            .map(|image| {
                report_image(&config, image, self.seed)
                    .with_context(|| format!("Image {}", image.image_id))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Matched {} images against {} stage thresholds",
            reports.len(),
            config.num_stages()
        );
        write_json(&reports, self.output.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_rcnn_core::{GroundTruthBox, ImageSize, ScoredBox};

    fn sample_image() -> ImageInput {
        ImageInput {
            image_id: 1,
            size: ImageSize::new(400.0, 400.0).unwrap(),
            proposals: vec![
                // IoU 0.9801, 0.6561 and 0 with the ground truth
                ScoredBox::new(BBox::new(10.0, 10.0, 109.0, 109.0), 0.9),
                ScoredBox::new(BBox::new(10.0, 10.0, 91.0, 91.0), 0.7),
                ScoredBox::new(BBox::new(200.0, 200.0, 250.0, 250.0), 0.8),
            ],
            ground_truth: vec![GroundTruthBox::new(BBox::new(10.0, 10.0, 110.0, 110.0), 1)],
        }
    }

    #[test]
    fn test_foreground_shrinks_with_threshold() {
        let report = report_image(&CascadeConfig::default(), &sample_image(), 0).unwrap();
        let fg: Vec<usize> = report.stages.iter().map(|s| s.foreground).collect();
        assert_eq!(fg, vec![2, 2, 1]);
        assert!(report.stages.iter().all(|s| s.candidates == 3));
        assert_eq!(report.stages[2].background, 2);
        assert_eq!(report.stages[2].sampled_foreground, 1);
    }

    #[test]
    fn test_out_of_range_class_is_rejected() {
        let mut image = sample_image();
        image.ground_truth[0].class_id = 500;
        assert!(report_image(&CascadeConfig::default(), &image, 0).is_err());
    }

    #[test]
    fn test_execute_reads_input() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("images.json");
        let output_path = dir.path().join("report.json");
        let input = AssignInput {
            images: vec![sample_image()],
        };
        std::fs::write(&input_path, serde_json::to_string(&input).unwrap()).unwrap();

        AssignCommand {
            config: None,
            input: input_path,
            seed: 3,
            output: Some(output_path.clone()),
        }
        .execute()
        .unwrap();

        let reports: Vec<ImageReport> =
            serde_json::from_str(&std::fs::read_to_string(&output_path).unwrap()).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stages.len(), 3);
    }
}
