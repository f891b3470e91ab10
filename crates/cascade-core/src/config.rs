//! Run-wide cascade configuration
//!
//! A [`CascadeConfig`] is built once (from a preset, YAML or JSON), validated,
//! and handed to [`crate::CascadeController::new`]. Nothing reads
//! configuration from ambient state.

use crate::codec::Normalization;
use crate::ensemble::ScoreEnsemble;
use crate::error::{CascadeError, Result};
use crate::head::RegressionMode;
use crate::sampler::SamplingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for one refinement stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Foreground IoU threshold (0.0-1.0]
    pub iou_threshold: f32,
    /// Standardization of this stage's regression targets
    pub normalization: Normalization,
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Scale applied to this stage's losses by the training loop
    #[serde(default = "default_loss_weight")]
    pub loss_weight: f32,
}

fn default_loss_weight() -> f32 {
    1.0
}

impl StageConfig {
    /// Stage with normalization derived from regression weights
    pub fn with_weights(iou_threshold: f32, weights: [f32; 4], loss_weight: f32) -> Result<Self> {
        Ok(Self {
            iou_threshold,
            normalization: Normalization::from_weights(weights)?,
            sampling: SamplingConfig::default(),
            loss_weight,
        })
    }
}

/// Detection assembly settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Proposals kept (by objectness) before stage 0
    pub proposal_top_k: usize,
    /// Class scores below this are dropped before NMS
    pub score_threshold: f32,
    /// Same-class IoU at or above this suppresses the lower-scoring box
    pub nms_threshold: f32,
    /// Maximum detections returned per image
    pub max_detections: usize,
    pub score_ensemble: ScoreEnsemble,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            proposal_top_k: 1000,
            score_threshold: 0.05,
            nms_threshold: 0.5,
            max_detections: 100,
            score_ensemble: ScoreEnsemble::Mean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Add ground-truth boxes to every stage's candidate pool
    pub append_ground_truth: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            append_ground_truth: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Number of classes including background
    pub num_classes: usize,
    #[serde(default)]
    pub regression: RegressionMode,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl Default for CascadeConfig {
    /// Three stages at IoU 0.5 / 0.6 / 0.7 over the 80 COCO classes
    fn default() -> Self {
        let stage = |iou_threshold, w: f32, loss_weight| StageConfig {
            iou_threshold,
            normalization: Normalization {
                mean: [0.0; 4],
                std: [1.0 / w, 1.0 / w, 2.0 / w, 2.0 / w],
            },
            sampling: SamplingConfig::default(),
            loss_weight,
        };
        Self {
            num_classes: 81,
            regression: RegressionMode::ClassAgnostic,
            stages: vec![
                stage(0.5, 10.0, 1.0),
                stage(0.6, 20.0, 0.5),
                stage(0.7, 30.0, 0.25),
            ],
            inference: InferenceConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl CascadeConfig {
    /// Two stages at IoU 0.5 / 0.7
    #[must_use]
    pub fn two_stage() -> Self {
        let mut config = Self::default();
        config.stages.remove(1);
        config.stages[1].loss_weight = 0.5;
        config
    }

    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(CascadeError::Config(format!(
                "num_classes must include background and at least one object class, got {}",
                self.num_classes
            )));
        }
        if self.stages.is_empty() {
            return Err(CascadeError::Config("at least one stage is required".to_string()));
        }

        let mut previous: Option<f32> = None;
        for (i, stage) in self.stages.iter().enumerate() {
            if !(stage.iou_threshold > 0.0 && stage.iou_threshold <= 1.0) {
                return Err(CascadeError::Config(format!(
                    "stage {i}: IoU threshold must be in (0, 1], got {}",
                    stage.iou_threshold
                )));
            }
            if let Some(prev) = previous {
                if stage.iou_threshold <= prev {
                    return Err(CascadeError::Config(format!(
                        "stage {i}: IoU threshold {} must exceed stage {} threshold {prev}",
                        stage.iou_threshold,
                        i - 1
                    )));
                }
            }
            previous = Some(stage.iou_threshold);

            stage
                .normalization
                .validate()
                .map_err(|e| CascadeError::Config(format!("stage {i}: {e}")))?;
            stage
                .sampling
                .validate()
                .map_err(|e| CascadeError::Config(format!("stage {i}: {e}")))?;
            if !stage.loss_weight.is_finite() || stage.loss_weight < 0.0 {
                return Err(CascadeError::Config(format!(
                    "stage {i}: loss weight must be non-negative, got {}",
                    stage.loss_weight
                )));
            }
        }

        let inf = &self.inference;
        if !(0.0..=1.0).contains(&inf.score_threshold) {
            return Err(CascadeError::Config(format!(
                "score_threshold must be in [0, 1], got {}",
                inf.score_threshold
            )));
        }
        if !(0.0..=1.0).contains(&inf.nms_threshold) {
            return Err(CascadeError::Config(format!(
                "nms_threshold must be in [0, 1], got {}",
                inf.nms_threshold
            )));
        }
        if inf.proposal_top_k == 0 || inf.max_detections == 0 {
            return Err(CascadeError::Config(
                "proposal_top_k and max_detections must be positive".to_string(),
            ));
        }
        inf.score_ensemble.validate(self.stages.len())?;

        Ok(())
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
