//! ROI boundary types: normalized bounding boxes, requested regions, and
//! the rendered evidence returned to the caller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Minimum crop dimension in pixels. Sub-pixel bounding boxes are extended
/// rightward/downward to this size to avoid zero-area crops from rounding.
pub const MIN_CROP_PX: u32 = 10;

/// Normalized bounding box with coordinates in [0.0, 1.0] relative to page
/// width/height, independent of render DPI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBoxNorm {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BBoxNorm {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Returns a corrected copy of this box: every coordinate clamped into
    /// [0.0, 1.0], and a degenerate or inverted axis replaced with the full
    /// extent (0.0–1.0). A corrected box is never degenerate.
    pub fn corrected(&self) -> BBoxNorm {
        let mut x0 = self.x0.clamp(0.0, 1.0);
        let mut y0 = self.y0.clamp(0.0, 1.0);
        let mut x1 = self.x1.clamp(0.0, 1.0);
        let mut y1 = self.y1.clamp(0.0, 1.0);

        if x0 >= x1 {
            (x0, x1) = (0.0, 1.0);
        }
        if y0 >= y1 {
            (y0, y1) = (0.0, 1.0);
        }

        BBoxNorm { x0, y0, x1, y1 }
    }

    /// Converts this box to pixel coordinates for an image of the given
    /// dimensions, enforcing the minimum crop size by extending the
    /// right/bottom edge (clamped to image bounds) — never the left/top.
    ///
    /// Meaningful only on a corrected box.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let left = (self.x0 * width as f64) as u32;
        let top = (self.y0 * height as f64) as u32;
        let mut right = (self.x1 * width as f64) as u32;
        let mut bottom = (self.y1 * height as f64) as u32;

        if right - left < MIN_CROP_PX {
            right = (left + MIN_CROP_PX).min(width);
        }
        if bottom - top < MIN_CROP_PX {
            bottom = (top + MIN_CROP_PX).min(height);
        }

        PixelRect { left, top, right, bottom }
    }
}

/// Pixel-space rectangle, half-open on the right/bottom edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    /// Estimated in-memory byte size of this region as RGB pixels.
    pub fn estimated_rgb_bytes(&self) -> u64 {
        self.width() as u64 * self.height() as u64 * 3
    }
}

/// A region of interest requested by the planner layer.
///
/// `page` is 1-indexed at this boundary; the engine converts to 0-indexed
/// internally. `reason` is the planner's justification and is ignored by
/// the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedRoi {
    pub block_id: String,
    pub page: u32,
    pub bbox_norm: BBoxNorm,
    pub dpi: u32,
    #[serde(default)]
    pub reason: String,
}

/// One rendered piece of evidence, returned per ROI request. Transient;
/// owned by the caller and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEvidence {
    pub block_id: String,
    /// Zero-indexed page number.
    pub page: u32,
    pub dpi: u32,
    /// Path to the full-page render.
    pub png_path: PathBuf,
    pub is_crop: bool,
    /// The normalized bounding box as requested (before correction).
    pub bbox_norm: BBoxNorm,
    /// Path to the crop, or to the full page if fallback occurred.
    pub crop_path: PathBuf,
    /// True if the crop failed and the full page was substituted. A
    /// diagnostic, not an error.
    pub is_fallback: bool,
}
