//! Training-side overlap statistics

use crate::boxes::{BBox, GroundTruthBox};
use crate::matcher::Assignment;
use crate::stage::{Origin, Proposal};
use serde::{Deserialize, Serialize};

/// Mean IoU with the matched ground truth before and after regression
///
/// Only foreground proposals that did not come from ground truth count.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RegressionQuality {
    pub count: usize,
    pub pre_mean_iou: f32,
    pub post_mean_iou: f32,
}

impl RegressionQuality {
    #[must_use]
    pub fn measure(proposals: &[Proposal], regressed: &[BBox], ground_truth: &[GroundTruthBox]) -> Self {
        let mut count = 0usize;
        let mut pre = 0.0f64;
        let mut post = 0.0f64;

        for (p, r) in proposals.iter().zip(regressed) {
            if matches!(p.origin, Origin::GroundTruth(_)) {
                continue;
            }
            let Some(gt) = p.assignment.matched_gt().and_then(|g| ground_truth.get(g)) else {
                continue;
            };
            count += 1;
            pre += f64::from(p.assignment.overlap());
            post += f64::from(r.iou(&gt.bbox));
        }

        if count == 0 {
            return Self::default();
        }
        Self {
            count,
            pre_mean_iou: (pre / count as f64) as f32,
            post_mean_iou: (post / count as f64) as f32,
        }
    }

    /// Positive when regression moved boxes closer to their targets
    #[must_use]
    pub fn improvement(&self) -> f32 {
        self.post_mean_iou - self.pre_mean_iou
    }
}

/// Mean best overlap over the selected candidates; 0 for an empty selection
pub fn mean_overlap(assignments: &[Assignment], selected: impl IntoIterator<Item = usize>) -> f32 {
    let mut n = 0usize;
    let mut sum = 0.0f64;
    for i in selected {
        if let Some(a) = assignments.get(i) {
            n += 1;
            sum += f64::from(a.overlap());
        }
    }
    if n == 0 {
        0.0
    } else {
        (sum / n as f64) as f32
    }
}
