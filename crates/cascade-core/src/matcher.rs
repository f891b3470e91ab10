//! Per-stage IoU matching of candidates against ground truth

use crate::boxes::{BBox, GroundTruthBox};
use crate::error::{CascadeError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Label assigned to a candidate by the matcher
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "label", rename_all = "snake_case")]
pub enum Assignment {
    Foreground {
        gt_index: usize,
        class_id: u32,
        overlap: f32,
    },
    Background {
        /// Best overlap with any ground truth (`None` when the image has none)
        gt_index: Option<usize>,
        overlap: f32,
    },
}

impl Assignment {
    #[must_use]
    pub fn is_foreground(&self) -> bool {
        matches!(self, Assignment::Foreground { .. })
    }

    #[must_use]
    pub fn overlap(&self) -> f32 {
        match *self {
            Assignment::Foreground { overlap, .. } | Assignment::Background { overlap, .. } => {
                overlap
            }
        }
    }

    /// Index of the matched ground truth, foreground only
    #[must_use]
    pub fn matched_gt(&self) -> Option<usize> {
        match *self {
            Assignment::Foreground { gt_index, .. } => Some(gt_index),
            Assignment::Background { .. } => None,
        }
    }

    /// Training label: the matched class, or 0 for background
    #[must_use]
    pub fn label(&self) -> u32 {
        match *self {
            Assignment::Foreground { class_id, .. } => class_id,
            Assignment::Background { .. } => 0,
        }
    }
}

/// Overlap matrix of shape `(candidates, ground_truth)`
#[must_use]
pub fn pairwise_iou(candidates: &[BBox], ground_truth: &[BBox]) -> Array2<f32> {
    Array2::from_shape_fn((candidates.len(), ground_truth.len()), |(i, j)| {
        candidates[i].iou(&ground_truth[j])
    })
}

/// Matcher with a single foreground threshold and no ignore band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IouMatcher {
    threshold: f32,
}

impl IouMatcher {
    pub fn new(threshold: f32) -> Result<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(CascadeError::Config(format!(
                "IoU threshold must be in (0, 1], got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Assign every candidate to its best ground truth
    ///
    /// Ties on the maximum overlap resolve to the lowest ground-truth index.
    #[must_use]
    pub fn assign(&self, candidates: &[BBox], ground_truth: &[GroundTruthBox]) -> Vec<Assignment> {
        if ground_truth.is_empty() {
            return vec![
                Assignment::Background {
                    gt_index: None,
                    overlap: 0.0,
                };
                candidates.len()
            ];
        }

        let gt_boxes: Vec<BBox> = ground_truth.iter().map(|g| g.bbox).collect();
        let overlaps = pairwise_iou(candidates, &gt_boxes);

        overlaps
            .rows()
            .into_iter()
            .map(|row| {
                let mut best = 0usize;
                let mut best_overlap = row[0];
                for (j, &value) in row.iter().enumerate().skip(1) {
                    if value > best_overlap {
                        best = j;
                        best_overlap = value;
                    }
                }

                if best_overlap >= self.threshold {
                    Assignment::Foreground {
                        gt_index: best,
                        class_id: ground_truth[best].class_id,
                        overlap: best_overlap,
                    }
                } else {
                    Assignment::Background {
                        gt_index: Some(best),
                        overlap: best_overlap,
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gt(x1: f32, y1: f32, x2: f32, y2: f32, class_id: u32) -> GroundTruthBox {
        GroundTruthBox::new(BBox::new(x1, y1, x2, y2), class_id)
    }

    #[test]
    fn test_threshold_validation() {
        assert!(IouMatcher::new(0.0).is_err());
        assert!(IouMatcher::new(1.5).is_err());
        assert!(IouMatcher::new(f32::NAN).is_err());
        assert!(IouMatcher::new(1.0).is_ok());
    }

    #[test]
    fn test_pairwise_iou_shape() {
        let a = [BBox::new(0.0, 0.0, 10.0, 10.0), BBox::new(5.0, 5.0, 15.0, 15.0)];
        let b = [BBox::new(0.0, 0.0, 10.0, 10.0)];
        let m = pairwise_iou(&a, &b);
        assert_eq!(m.dim(), (2, 1));
        assert_eq!(m[[0, 0]], 1.0);
    }

    #[test]
    fn test_foreground_and_background() {
        let matcher = IouMatcher::new(0.5).unwrap();
        let gts = [gt(10.0, 10.0, 110.0, 110.0, 1)];
        let candidates = [
            BBox::new(10.0, 10.0, 109.0, 109.0),
            BBox::new(200.0, 200.0, 250.0, 250.0),
        ];
        let a = matcher.assign(&candidates, &gts);

        assert_eq!(a[0].label(), 1);
        assert_eq!(a[0].matched_gt(), Some(0));
        assert!(!a[1].is_foreground());
        assert_eq!(a[1].overlap(), 0.0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // candidate covers exactly half of the union
        let gts = [gt(0.0, 0.0, 10.0, 10.0, 3)];
        let candidates = [BBox::new(0.0, 0.0, 10.0, 5.0)];
        let a = IouMatcher::new(0.5).unwrap().assign(&candidates, &gts);
        assert!(a[0].is_foreground());
    }

    #[test]
    fn test_tie_breaks_to_lowest_index() {
        let gts = [
            gt(0.0, 0.0, 10.0, 10.0, 2),
            gt(0.0, 0.0, 10.0, 10.0, 5),
        ];
        let candidates = [BBox::new(0.0, 0.0, 10.0, 10.0)];
        let a = IouMatcher::new(0.5).unwrap().assign(&candidates, &gts);
        assert_eq!(
            a[0],
            Assignment::Foreground {
                gt_index: 0,
                class_id: 2,
                overlap: 1.0
            }
        );
    }

    #[test]
    fn test_no_ground_truth_is_all_background() {
        let candidates = [BBox::new(0.0, 0.0, 10.0, 10.0), BBox::new(1.0, 1.0, 4.0, 4.0)];
        let a = IouMatcher::new(0.5).unwrap().assign(&candidates, &[]);
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|x| !x.is_foreground() && x.overlap() == 0.0));
    }

    #[test]
    fn test_stricter_threshold_flips_label() {
        let gts = [gt(0.0, 0.0, 100.0, 100.0, 1)];
        // IoU = 0.64
        let candidates = [BBox::new(0.0, 0.0, 80.0, 80.0)];
        let loose = IouMatcher::new(0.5).unwrap().assign(&candidates, &gts);
        let strict = IouMatcher::new(0.7).unwrap().assign(&candidates, &gts);
        assert!(loose[0].is_foreground());
        assert!(!strict[0].is_foreground());
        assert_eq!(strict[0].overlap(), loose[0].overlap());
    }

    #[test]
    fn test_assignment_serialization() {
        let a = Assignment::Foreground {
            gt_index: 1,
            class_id: 7,
            overlap: 0.75,
        };
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains("\"label\":\"foreground\""));
        let back: Assignment = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
