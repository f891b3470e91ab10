//! Box delta encoding relative to a reference box
//!
//! Deltas use the standard parameterization: center offsets divided by the
//! reference width/height, and log ratios of width and height. Each component
//! is then standardized with a per-stage mean and standard deviation.
//!
//! Arithmetic runs in f64 and narrows to f32 at the boundary.

use crate::boxes::{BBox, ImageSize};
use crate::error::{CascadeError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound applied to width/height deltas before exponentiation: ln(1000/16)
pub const DELTA_SCALE_CLAMP: f64 = 4.135_166_556_742_356;

/// Regression deltas `(dx, dy, dw, dh)` in normalized space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoxDelta {
    pub dx: f32,
    pub dy: f32,
    pub dw: f32,
    pub dh: f32,
}

impl BoxDelta {
    #[must_use]
    pub fn new(dx: f32, dy: f32, dw: f32, dh: f32) -> Self {
        Self { dx, dy, dw, dh }
    }

    #[must_use]
    pub fn to_array(&self) -> [f32; 4] {
        [self.dx, self.dy, self.dw, self.dh]
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

impl From<[f32; 4]> for BoxDelta {
    fn from(d: [f32; 4]) -> Self {
        Self::new(d[0], d[1], d[2], d[3])
    }
}

/// Per-coordinate standardization constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 4],
    pub std: [f32; 4],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: [0.0; 4],
            std: [1.0; 4],
        }
    }
}

impl Normalization {
    pub fn new(mean: [f32; 4], std: [f32; 4]) -> Result<Self> {
        let norm = Self { mean, std };
        norm.validate()?;
        Ok(norm)
    }

    /// Build from regression weights `(wx, wy, ww, wh)`: mean 0, std `1 / w`
    pub fn from_weights(weights: [f32; 4]) -> Result<Self> {
        if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(CascadeError::Config(format!(
                "regression weights must be positive, got {weights:?}"
            )));
        }
        Self::new([0.0; 4], weights.map(|w| 1.0 / w))
    }

    pub fn validate(&self) -> Result<()> {
        if self.mean.iter().any(|m| !m.is_finite()) {
            return Err(CascadeError::Config(format!(
                "normalization mean must be finite, got {:?}",
                self.mean
            )));
        }
        if self.std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(CascadeError::Config(format!(
                "normalization std must be positive, got {:?}",
                self.std
            )));
        }
        Ok(())
    }
}

/// Encoder/decoder bound to one stage's normalization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    normalization: Normalization,
}

impl BoxCoder {
    #[must_use]
    pub fn new(normalization: Normalization) -> Self {
        Self { normalization }
    }

    #[must_use]
    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    /// Deltas that move `reference` onto `target`
    pub fn encode(&self, reference: &BBox, target: &BBox) -> Result<BoxDelta> {
        reference.validate()?;
        target.validate()?;

        let (rw, rh, rcx, rcy) = center_form(reference);
        let (tw, th, tcx, tcy) = center_form(target);

        let raw = [
            (tcx - rcx) / rw,
            (tcy - rcy) / rh,
            (tw / rw).ln(),
            (th / rh).ln(),
        ];
        let n = &self.normalization;
        let d: [f32; 4] =
            std::array::from_fn(|i| ((raw[i] - f64::from(n.mean[i])) / f64::from(n.std[i])) as f32);
        Ok(BoxDelta::from(d))
    }

    /// Apply `delta` to `reference` without clipping
    pub fn decode_unclipped(&self, reference: &BBox, delta: &BoxDelta) -> Result<BBox> {
        reference.validate()?;
        if !delta.is_finite() {
            return Err(CascadeError::NonFinite("box deltas"));
        }

        let (rw, rh, rcx, rcy) = center_form(reference);
        let n = &self.normalization;
        let d = delta.to_array();
        let raw: [f64; 4] =
            std::array::from_fn(|i| f64::from(d[i]) * f64::from(n.std[i]) + f64::from(n.mean[i]));

        let dw = raw[2].min(DELTA_SCALE_CLAMP);
        let dh = raw[3].min(DELTA_SCALE_CLAMP);

        let cx = raw[0] * rw + rcx;
        let cy = raw[1] * rh + rcy;
        let w = dw.exp() * rw;
        let h = dh.exp() * rh;

        Ok(BBox::new(
            (cx - 0.5 * w) as f32,
            (cy - 0.5 * h) as f32,
            (cx + 0.5 * w) as f32,
            (cy + 0.5 * h) as f32,
        ))
    }

    /// Apply `delta` to `reference` and clip to the image; the result may be empty
    pub fn decode(&self, reference: &BBox, delta: &BoxDelta, bounds: ImageSize) -> Result<BBox> {
        Ok(self.decode_unclipped(reference, delta)?.clip(bounds))
    }
}

fn center_form(b: &BBox) -> (f64, f64, f64, f64) {
    let w = f64::from(b.x2) - f64::from(b.x1);
    let h = f64::from(b.y2) - f64::from(b.y1);
    (w, h, f64::from(b.x1) + 0.5 * w, f64::from(b.y1) + 0.5 * h)
}
