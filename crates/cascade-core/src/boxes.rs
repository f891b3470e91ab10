//! Axis-aligned boxes in image pixel space
//!
//! Boxes use continuous coordinates: width is `x2 - x1`, height is `y2 - y1`.
//! Construction always orders the corners so that `x1 <= x2` and `y1 <= y2`.

use crate::error::{CascadeError, Result};
use serde::{Deserialize, Serialize};

/// Image dimensions used as clipping bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: f32,
    pub height: f32,
}

impl ImageSize {
    /// Create image dimensions, rejecting non-positive or non-finite sizes
    pub fn new(width: f32, height: f32) -> Result<Self> {
        let size = Self { width, height };
        size.validate()?;
        Ok(size)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.width.is_finite() && self.height.is_finite()) {
            return Err(CascadeError::NonFinite("image size"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(CascadeError::InvalidInput(format!(
                "image size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Bounding box with corner coordinates `(x1, y1, x2, y2)`
///
/// Serialized as a `[x1, y1, x2, y2]` array. Deserialization goes through
/// [`BBox::new`], so corner ordering holds for boxes read from JSON or YAML.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    #[inline]
    #[must_use]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (x1, x2) = ordered(x1, x2);
        let (y1, y2) = ordered(y1, y2);
        Self { x1, y1, x2, y2 }
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[inline]
    #[must_use]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    #[inline]
    #[must_use]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        (
            self.x1 + 0.5 * self.width(),
            self.y1 + 0.5 * self.height(),
        )
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// True when the box has zero width or zero height
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    /// Fail fast on boxes that cannot be used as geometry
    pub fn validate(&self) -> Result<()> {
        if !self.is_finite() {
            return Err(CascadeError::NonFinite("box coordinates"));
        }
        if self.is_empty() {
            return Err(CascadeError::DegenerateBox {
                bbox: *self,
                reason: "zero width or height",
            });
        }
        Ok(())
    }

    /// Clip to `[0, width] x [0, height]`; the result may be empty
    #[must_use]
    pub fn clip(&self, bounds: ImageSize) -> Self {
        Self {
            x1: self.x1.clamp(0.0, bounds.width),
            y1: self.y1.clamp(0.0, bounds.height),
            x2: self.x2.clamp(0.0, bounds.width),
            y2: self.y2.clamp(0.0, bounds.height),
        }
    }

    #[inline]
    #[must_use]
    pub fn intersection_area(&self, other: &Self) -> f32 {
        let width = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let height = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        width * height
    }

    /// Intersection over union; 0 when the union is empty
    #[inline]
    #[must_use]
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// `[x, y, width, height]`, the layout of detection-result files
    #[must_use]
    pub fn to_xywh(&self) -> [f32; 4] {
        [self.x1, self.y1, self.width(), self.height()]
    }
}

/// Ascending pair; a NaN stays where it is so `validate` can report it
#[inline]
fn ordered(a: f32, b: f32) -> (f32, f32) {
    if b < a {
        (b, a)
    } else {
        (a, b)
    }
}

impl From<[f32; 4]> for BBox {
    fn from(c: [f32; 4]) -> Self {
        Self::new(c[0], c[1], c[2], c[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Annotated object; class 0 is reserved for background
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthBox {
    pub bbox: BBox,
    pub class_id: u32,
}

impl GroundTruthBox {
    #[must_use]
    pub fn new(bbox: BBox, class_id: u32) -> Self {
        Self { bbox, class_id }
    }

    pub fn validate(&self) -> Result<()> {
        self.bbox.validate()?;
        if self.class_id == 0 {
            return Err(CascadeError::InvalidInput(
                "ground-truth class 0 is reserved for background".to_string(),
            ));
        }
        Ok(())
    }
}

/// Region proposal with its objectness score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredBox {
    pub bbox: BBox,
    pub score: f32,
}

impl ScoredBox {
    #[must_use]
    pub fn new(bbox: BBox, score: f32) -> Self {
        Self { bbox, score }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_orders_corners() {
        let b = BBox::new(10.0, 20.0, 0.0, 5.0);
        assert_eq!(b, BBox { x1: 0.0, y1: 5.0, x2: 10.0, y2: 20.0 });
        assert_eq!(b.width(), 10.0);
        assert_eq!(b.height(), 15.0);
    }

    #[test]
    fn test_area_and_center() {
        let b = BBox::new(10.0, 10.0, 110.0, 60.0);
        assert_eq!(b.area(), 5000.0);
        assert_eq!(b.center(), (60.0, 35.0));
    }

    #[test]
    fn test_iou() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        // 25 / (100 + 100 - 25)
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
        assert_eq!(a.iou(&a), 1.0);

        let far = BBox::new(50.0, 50.0, 60.0, 60.0);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_iou_degenerate_union_is_zero() {
        let point = BBox::new(3.0, 3.0, 3.0, 3.0);
        assert_eq!(point.iou(&point), 0.0);
    }

    #[test]
    fn test_scenario_overlap() {
        let gt = BBox::new(10.0, 10.0, 110.0, 110.0);
        let near = BBox::new(10.0, 10.0, 109.0, 109.0);
        assert!((gt.iou(&near) - 0.9801).abs() < 1e-4);
    }

    #[test]
    fn test_clip() {
        let size = ImageSize::new(100.0, 50.0).unwrap();
        let b = BBox::new(-10.0, -5.0, 120.0, 40.0).clip(size);
        assert_eq!(b, BBox::new(0.0, 0.0, 100.0, 40.0));

        let outside = BBox::new(150.0, 10.0, 200.0, 20.0).clip(size);
        assert!(outside.is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(BBox::new(0.0, 0.0, 1.0, 1.0).validate().is_ok());
        assert!(matches!(
            BBox::new(0.0, 0.0, 0.0, 1.0).validate(),
            Err(CascadeError::DegenerateBox { .. })
        ));
        assert!(matches!(
            BBox::new(0.0, f32::NAN, 1.0, 1.0).validate(),
            Err(CascadeError::NonFinite(_))
        ));
        assert!(matches!(
            BBox::new(f32::NAN, 0.0, 10.0, 10.0).validate(),
            Err(CascadeError::NonFinite(_))
        ));
    }

    #[test]
    fn test_new_keeps_nan() {
        let b = BBox::new(f32::NAN, 0.0, 10.0, 10.0);
        assert!(b.x1.is_nan());
        assert_eq!(b.x2, 10.0);
        assert!(!b.is_finite());

        let parsed: BBox = serde_json::from_str("[0.0, 0.0, 5.0, 5.0]").unwrap();
        assert!(parsed.is_finite());
    }

    #[test]
    fn test_image_size_rejects_zero() {
        assert!(ImageSize::new(0.0, 10.0).is_err());
        assert!(ImageSize::new(f32::INFINITY, 10.0).is_err());
    }

    #[test]
    fn test_ground_truth_rejects_background_class() {
        let gt = GroundTruthBox::new(BBox::new(0.0, 0.0, 5.0, 5.0), 0);
        assert!(gt.validate().is_err());
    }

    #[test]
    fn test_serde_array_form() {
        let b: BBox = serde_json::from_str("[30.0, 40.0, 10.0, 20.0]").unwrap();
        assert_eq!(b, BBox::new(10.0, 20.0, 30.0, 40.0));
        assert_eq!(serde_json::to_string(&b).unwrap(), "[10.0,20.0,30.0,40.0]");
    }

    #[test]
    fn test_to_xywh() {
        let b = BBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(b.to_xywh(), [10.0, 20.0, 20.0, 40.0]);
    }
}
