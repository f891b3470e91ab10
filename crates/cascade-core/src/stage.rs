//! Per-stage data passed between the controller, the ensembler and the
//! training loop
//!
//! Each stage allocates its own outputs; nothing from an earlier stage is
//! mutated once that stage completes.

use crate::boxes::BBox;
use crate::codec::BoxDelta;
use crate::head::{HeadOutput, RegressionMode};
use crate::matcher::Assignment;
use crate::metrics::RegressionQuality;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Where a candidate entered the cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Index into the image's region proposals
    Proposal(usize),
    /// Index into the image's ground truth (training augmentation)
    GroundTruth(usize),
}

/// A candidate box at one stage, with its match against ground truth
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub bbox: BBox,
    pub image_id: u64,
    pub stage: usize,
    pub origin: Origin,
    pub assignment: Assignment,
    /// Encoded offset to the matched ground truth; `None` for background
    pub target: Option<BoxDelta>,
}

/// Inference-time output of one stage for one image
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub stage: usize,
    /// Stage-0 candidate index of every row, strictly ascending
    pub origins: Vec<usize>,
    /// Input geometry fed to the head
    pub boxes: Vec<BBox>,
    /// Labels of `boxes` under this stage's threshold
    pub assignments: Vec<Assignment>,
    pub head: HeadOutput,
    /// Decoded and clipped; empty boxes do not advance
    pub regressed: Vec<BBox>,
}

impl StageOutput {
    #[must_use]
    pub fn empty(stage: usize, num_classes: usize, mode: RegressionMode) -> Self {
        Self {
            stage,
            origins: Vec::new(),
            boxes: Vec::new(),
            assignments: Vec::new(),
            head: HeadOutput::empty(num_classes, mode),
            regressed: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Row holding the candidate that entered the cascade as `origin`
    #[must_use]
    pub fn row_of(&self, origin: usize) -> Option<usize> {
        self.origins.binary_search(&origin).ok()
    }

    /// `(origin, box)` pairs that feed the next stage
    pub fn advancing(&self) -> impl Iterator<Item = (usize, BBox)> + '_ {
        self.origins
            .iter()
            .copied()
            .zip(self.regressed.iter().copied())
            .filter(|(_, b)| !b.is_empty())
    }
}

/// One `(label, target, scores, deltas)` tuple for loss computation
#[derive(Debug, Clone)]
pub struct TrainingSample<'a> {
    pub label: u32,
    pub target: Option<BoxDelta>,
    pub class_scores: ArrayView1<'a, f32>,
    pub deltas: ArrayView1<'a, f32>,
}

/// Training-time output of one stage for one image
#[derive(Debug, Clone, PartialEq)]
pub struct StageTrainingOutput {
    pub stage: usize,
    /// Sampled candidates, foreground first
    pub proposals: Vec<Proposal>,
    pub head: HeadOutput,
    /// Decoded and clipped output geometry, one per proposal
    pub regressed: Vec<BBox>,
    pub loss_weight: f32,
    /// Mean best overlap of the sampled candidates
    pub pool_mean_overlap: f32,
    pub quality: RegressionQuality,
}

impl StageTrainingOutput {
    #[must_use]
    pub fn foreground_count(&self) -> usize {
        self.proposals
            .iter()
            .filter(|p| p.assignment.is_foreground())
            .count()
    }

    pub fn samples(&self) -> impl Iterator<Item = TrainingSample<'_>> + '_ {
        self.proposals.iter().enumerate().map(move |(i, p)| TrainingSample {
            label: p.assignment.label(),
            target: p.target,
            class_scores: self.head.class_scores.row(i),
            deltas: self.head.deltas.row(i),
        })
    }

    #[must_use]
    pub fn loss_targets(&self, num_classes: usize, mode: RegressionMode) -> LossTargets {
        LossTargets::expand(&self.proposals, num_classes, mode)
    }
}

/// Regression targets laid out for a `4 * K` output layer
///
/// `K` is 2 (background, foreground) for class-agnostic regression and
/// `num_classes` otherwise. Only the slot of the matched class is filled.
#[derive(Debug, Clone, PartialEq)]
pub struct LossTargets {
    pub labels: Vec<i32>,
    pub bbox_targets: Array2<f32>,
    pub inside_weights: Array2<f32>,
    pub outside_weights: Array2<f32>,
}

impl LossTargets {
    #[must_use]
    pub fn expand(proposals: &[Proposal], num_classes: usize, mode: RegressionMode) -> Self {
        let slots = match mode {
            RegressionMode::ClassAgnostic => 2,
            RegressionMode::ClassSpecific => num_classes,
        };
        let mut bbox_targets = Array2::zeros((proposals.len(), 4 * slots));
        let mut inside_weights = Array2::zeros((proposals.len(), 4 * slots));

        for (i, p) in proposals.iter().enumerate() {
            let (Some(target), label) = (p.target, p.assignment.label()) else {
                continue;
            };
            if label == 0 {
                continue;
            }
            let slot = match mode {
                RegressionMode::ClassAgnostic => 1,
                RegressionMode::ClassSpecific => label as usize,
            };
            if slot >= slots {
                continue;
            }
            for (k, v) in target.to_array().into_iter().enumerate() {
                bbox_targets[[i, 4 * slot + k]] = v;
                inside_weights[[i, 4 * slot + k]] = 1.0;
            }
        }

        let outside_weights = inside_weights.mapv(|w: f32| if w > 0.0 { 1.0 } else { 0.0 });
        Self {
            labels: proposals.iter().map(|p| p.assignment.label() as i32).collect(),
            bbox_targets,
            inside_weights,
            outside_weights,
        }
    }
}
