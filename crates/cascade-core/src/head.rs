//! Per-stage head seam
//!
//! The numeric head (feature pooling, fully connected layers, softmax) lives in
//! the surrounding framework. The cascade only sees its output: one row of
//! class scores and one row of deltas per input box.

use crate::boxes::BBox;
use crate::codec::BoxDelta;
use crate::error::{CascadeError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Layout of the regression output, fixed for a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionMode {
    /// One set of deltas per box (4 columns, or 8 with a background slot)
    #[default]
    ClassAgnostic,
    /// One set of deltas per class (`4 * num_classes` columns)
    ClassSpecific,
}

/// Raw output of one stage head for one image
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutput {
    /// `(boxes, num_classes)`, column 0 is background
    pub class_scores: Array2<f32>,
    /// `(boxes, 4 | 8 | 4 * num_classes)`
    pub deltas: Array2<f32>,
}

impl HeadOutput {
    #[must_use]
    pub fn new(class_scores: Array2<f32>, deltas: Array2<f32>) -> Self {
        Self {
            class_scores,
            deltas,
        }
    }

    /// Output for zero boxes
    #[must_use]
    pub fn empty(num_classes: usize, mode: RegressionMode) -> Self {
        let delta_cols = match mode {
            RegressionMode::ClassAgnostic => 4,
            RegressionMode::ClassSpecific => 4 * num_classes,
        };
        Self::new(
            Array2::zeros((0, num_classes)),
            Array2::zeros((0, delta_cols)),
        )
    }

    /// Build from row-major nested vectors
    pub fn from_rows(class_scores: &[Vec<f32>], deltas: &[Vec<f32>]) -> Result<Self> {
        Ok(Self::new(to_array(class_scores, "class scores")?, to_array(deltas, "deltas")?))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.class_scores.nrows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check shapes against the boxes that were fed to the head
    pub fn validate(&self, rows: usize, num_classes: usize, mode: RegressionMode) -> Result<()> {
        if self.class_scores.nrows() != rows {
            return Err(CascadeError::LengthMismatch {
                what: "class score rows",
                expected: rows,
                actual: self.class_scores.nrows(),
            });
        }
        if self.deltas.nrows() != rows {
            return Err(CascadeError::LengthMismatch {
                what: "delta rows",
                expected: rows,
                actual: self.deltas.nrows(),
            });
        }
        if self.class_scores.ncols() != num_classes {
            return Err(CascadeError::LengthMismatch {
                what: "class score columns",
                expected: num_classes,
                actual: self.class_scores.ncols(),
            });
        }
        let cols = self.deltas.ncols();
        let valid = match mode {
            RegressionMode::ClassAgnostic => cols == 4 || cols == 8,
            RegressionMode::ClassSpecific => cols == 4 * num_classes,
        };
        if !valid {
            let expected = match mode {
                RegressionMode::ClassAgnostic => 4,
                RegressionMode::ClassSpecific => 4 * num_classes,
            };
            return Err(CascadeError::LengthMismatch {
                what: "delta columns",
                expected,
                actual: cols,
            });
        }
        if self.class_scores.iter().any(|v| !v.is_finite()) {
            return Err(CascadeError::NonFinite("class scores"));
        }
        Ok(())
    }

    /// Deltas for `row`; `class_id` selects the slot in class-specific mode
    #[must_use]
    pub fn delta(&self, row: usize, class_id: u32, mode: RegressionMode) -> BoxDelta {
        let start = match mode {
            // with a background slot the foreground deltas are the last four
            RegressionMode::ClassAgnostic => self.deltas.ncols() - 4,
            RegressionMode::ClassSpecific => 4 * class_id as usize,
        };
        let r = self.deltas.row(row);
        BoxDelta::new(r[start], r[start + 1], r[start + 2], r[start + 3])
    }

    /// Highest-scoring non-background class for `row`; ties go to the lower class
    #[must_use]
    pub fn predicted_class(&self, row: usize) -> u32 {
        let scores = self.class_scores.row(row);
        let mut best = 1usize;
        for c in 2..scores.len() {
            if scores[c] > scores[best] {
                best = c;
            }
        }
        best as u32
    }
}

fn to_array(rows: &[Vec<f32>], what: &'static str) -> Result<Array2<f32>> {
    let cols = rows.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(rows.len() * cols);
    for row in rows {
        if row.len() != cols {
            return Err(CascadeError::LengthMismatch {
                what,
                expected: cols,
                actual: row.len(),
            });
        }
        flat.extend_from_slice(row);
    }
    Array2::from_shape_vec((rows.len(), cols), flat)
        .map_err(|e| CascadeError::InvalidInput(format!("{what}: {e}")))
}

/// Scores and regresses a set of boxes for one stage
///
/// Implementations must be stateless between calls apart from their learned
/// parameters. `Features` is whatever per-image context the framework needs
/// to pool per-box features; the cascade treats it as opaque.
pub trait StageHead: Sync {
    type Features: ?Sized + Sync;

    /// Number of classes including background
    fn num_classes(&self) -> usize;

    fn forward(&self, stage: usize, features: &Self::Features, boxes: &[BBox])
        -> Result<HeadOutput>;
}

/// Head outputs captured from a network run, in row-major JSON form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedStage {
    pub class_scores: Vec<Vec<f32>>,
    pub deltas: Vec<Vec<f32>>,
}

/// Replays recorded outputs, one [`RecordedStage`] per cascade stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedHead {
    num_classes: usize,
}

impl RecordedHead {
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl StageHead for RecordedHead {
    type Features = [RecordedStage];

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(
        &self,
        stage: usize,
        features: &Self::Features,
        boxes: &[BBox],
    ) -> Result<HeadOutput> {
        let recorded = features.get(stage).ok_or_else(|| CascadeError::Head {
            stage,
            message: format!("no recording for stage (have {})", features.len()),
        })?;
        if recorded.class_scores.len() != boxes.len() {
            return Err(CascadeError::Head {
                stage,
                message: format!(
                    "recording has {} rows but {} boxes reached the stage",
                    recorded.class_scores.len(),
                    boxes.len()
                ),
            });
        }
        HeadOutput::from_rows(&recorded.class_scores, &recorded.deltas)
    }
}
