//! Final detection assembly
//!
//! Class scores from every stage are combined per candidate (tracked by its
//! stage-0 origin), geometry comes from the last stage, and class-wise
//! non-maximum suppression removes duplicates.

use crate::boxes::BBox;
use crate::cascade::CascadeState;
use crate::codec::BoxCoder;
use crate::config::{CascadeConfig, InferenceConfig};
use crate::error::{CascadeError, Result};
use crate::head::RegressionMode;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How per-stage class scores combine into the final score
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ScoreEnsemble {
    /// Arithmetic mean over all stages
    #[default]
    Mean,
    /// Weighted mean; weights are normalized to sum to 1
    Weighted { weights: Vec<f32> },
    /// Scores of the last stage only
    LastStage,
}

impl ScoreEnsemble {
    pub fn validate(&self, num_stages: usize) -> Result<()> {
        if let ScoreEnsemble::Weighted { weights } = self {
            if weights.len() != num_stages {
                return Err(CascadeError::Config(format!(
                    "score ensemble has {} weights for {num_stages} stages",
                    weights.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(CascadeError::Config(
                    "score ensemble weights must be non-negative".to_string(),
                ));
            }
            if weights.iter().sum::<f32>() <= 0.0 {
                return Err(CascadeError::Config(
                    "score ensemble weights must not all be zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Per-stage weights summing to 1
    #[must_use]
    pub fn stage_weights(&self, num_stages: usize) -> Vec<f32> {
        match self {
            ScoreEnsemble::Mean => vec![1.0 / num_stages as f32; num_stages],
            ScoreEnsemble::Weighted { weights } => {
                let total: f32 = weights.iter().sum();
                weights.iter().map(|w| w / total).collect()
            }
            ScoreEnsemble::LastStage => {
                let mut w = vec![0.0; num_stages];
                if let Some(last) = w.last_mut() {
                    *last = 1.0;
                }
                w
            }
        }
    }
}

/// Final detection for one image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: u32,
    pub score: f32,
    /// Index of the region proposal this detection grew from
    pub origin: usize,
}

/// One row of a detection-result file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub image_id: u64,
    pub category_id: u32,
    /// `[x, y, width, height]`
    pub bbox: [f32; 4],
    pub score: f32,
}

impl Detection {
    #[must_use]
    pub fn to_record(&self, image_id: u64) -> DetectionRecord {
        DetectionRecord {
            image_id,
            category_id: self.class_id,
            bbox: self.bbox.to_xywh(),
            score: self.score,
        }
    }
}

pub struct InferenceEnsembler {
    inference: InferenceConfig,
    regression: RegressionMode,
    last_coder: BoxCoder,
    weights: Vec<f32>,
}

impl InferenceEnsembler {
    pub fn new(config: &CascadeConfig) -> Result<Self> {
        let last = config
            .stages
            .last()
            .ok_or_else(|| CascadeError::Config("at least one stage is required".to_string()))?;
        config.inference.score_ensemble.validate(config.stages.len())?;

        Ok(Self {
            inference: config.inference.clone(),
            regression: config.regression,
            last_coder: BoxCoder::new(last.normalization),
            weights: config.inference.score_ensemble.stage_weights(config.stages.len()),
        })
    }

    /// Combined class scores, one row per last-stage candidate
    pub fn ensemble_scores(&self, state: &CascadeState) -> Result<Array2<f32>> {
        let Some(last) = state.stages.last() else {
            return Ok(Array2::zeros((0, 0)));
        };
        if state.stages.len() != self.weights.len() {
            return Err(CascadeError::LengthMismatch {
                what: "cascade stages",
                expected: self.weights.len(),
                actual: state.stages.len(),
            });
        }

        let num_classes = last.head.class_scores.ncols();
        let mut combined = Array2::zeros((last.len(), num_classes));

        for (row, &origin) in last.origins.iter().enumerate() {
            let mut acc = Array1::<f32>::zeros(num_classes);
            for (stage, &weight) in state.stages.iter().zip(&self.weights) {
                if weight == 0.0 {
                    continue;
                }
                let stage_row = stage.row_of(origin).ok_or_else(|| {
                    CascadeError::InvalidInput(format!(
                        "candidate {origin} missing from stage {}",
                        stage.stage
                    ))
                })?;
                acc.scaled_add(weight, &stage.head.class_scores.row(stage_row));
            }
            combined.row_mut(row).assign(&acc);
        }

        Ok(combined)
    }

    /// Score filtering, class-wise NMS and the per-image cap
    pub fn finalize(&self, state: &CascadeState) -> Result<Vec<Detection>> {
        let Some(last) = state.stages.last() else {
            return Ok(Vec::new());
        };
        let scores = self.ensemble_scores(state)?;

        let mut candidates = Vec::new();
        for (row, &origin) in last.origins.iter().enumerate() {
            for class in 1..scores.ncols() {
                let score = scores[[row, class]];
                if score < self.inference.score_threshold {
                    continue;
                }
                let bbox = match self.regression {
                    RegressionMode::ClassAgnostic => last.regressed[row],
                    RegressionMode::ClassSpecific => self.last_coder.decode(
                        &last.boxes[row],
                        &last.head.delta(row, class as u32, self.regression),
                        state.size,
                    )?,
                };
                if bbox.is_empty() {
                    continue;
                }
                candidates.push(Detection {
                    bbox,
                    class_id: class as u32,
                    score,
                    origin,
                });
            }
        }

        let before = candidates.len();
        let mut kept = class_wise_nms(candidates, self.inference.nms_threshold);
        kept.truncate(self.inference.max_detections);
        debug!(
            "Image {}: {} candidates above score threshold, {} detections after NMS",
            state.image_id,
            before,
            kept.len()
        );
        Ok(kept)
    }
}

fn by_score(a: &Detection, b: &Detection) -> std::cmp::Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.origin.cmp(&b.origin))
        .then(a.class_id.cmp(&b.class_id))
}

/// Greedy per-class suppression, output sorted by descending score
///
/// A detection survives only if its IoU with every already kept detection of
/// the same class is below `threshold`.
#[must_use]
pub fn class_wise_nms(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.sort_by(by_score);

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = keep
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) >= threshold);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}
