//! Geometry shared by the detector, the reading-order sorter and the PDF writer.
//!
//! Two coordinate spaces meet here:
//! - normalized image space: `[0, 1]` relative to the rendered page image,
//!   origin at the top-left, y growing downward;
//! - PDF user space: points, origin at the bottom-left, y growing upward,
//!   anchored at the page's CropBox (or MediaBox when there is no CropBox).

use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Normalized rectangle on a rendered page image (top-left origin).
///
/// No ordering between `x0`/`x1` or `y0`/`y1` is enforced; consumers such as
/// [`page_rect`] normalize on their side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    /// Left edge
    pub x0: f64,
    /// Top edge
    pub y0: f64,
    /// Right edge
    pub x1: f64,
    /// Bottom edge
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Build a box from the detector's center/extent convention.
    pub fn from_center(cx: f64, cy: f64, w: f64, h: f64) -> Self {
        Self {
            x0: cx - w / 2.0,
            y0: cy - h / 2.0,
            x1: cx + w / 2.0,
            y1: cy + h / 2.0,
        }
    }

    /// Center point `(cx, cy)`
    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// Extents `(w, h)`
    pub fn size(&self) -> (f64, f64) {
        (self.x1 - self.x0, self.y1 - self.y0)
    }

    pub fn area(&self) -> f64 {
        let (w, h) = self.size();
        (w * h).abs()
    }

    /// Intersection over Union with another box
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let ix0 = self.x0.min(self.x1).max(other.x0.min(other.x1));
        let iy0 = self.y0.min(self.y1).max(other.y0.min(other.y1));
        let ix1 = self.x0.max(self.x1).min(other.x0.max(other.x1));
        let iy1 = self.y0.max(self.y1).min(other.y0.max(other.y1));

        let intersection = (ix1 - ix0).max(0.0) * (iy1 - iy0).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Clamp every coordinate into `[0, 1]`.
    pub fn clamped(&self) -> Self {
        Self {
            x0: self.x0.clamp(0.0, 1.0),
            y0: self.y0.clamp(0.0, 1.0),
            x1: self.x1.clamp(0.0, 1.0),
            y1: self.y1.clamp(0.0, 1.0),
        }
    }
}

/// A page's CropBox or MediaBox as the document model reports it.
///
/// `top` and `bottom` are taken verbatim from the PDF array, so a box written
/// upside down (`top < bottom`) is represented as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PageBox {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl PageBox {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    /// From a PDF rectangle array `[llx lly urx ury]`
    pub fn from_array(values: [f64; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn width(&self) -> f64 {
        (self.right - self.left).abs()
    }

    pub fn height(&self) -> f64 {
        (self.top - self.bottom).abs()
    }
}

/// Rectangle in PDF user space with `x0 <= x1` and `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PdfRect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl PdfRect {
    /// Build a rectangle, swapping components pairwise so it is never inverted.
    pub fn normalized(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        let (x0, x1) = if x0 > x1 { (x1, x0) } else { (x0, x1) };
        let (y0, y1) = if y0 > y1 { (y1, y0) } else { (y0, y1) };
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    /// Whether this rectangle lies inside the page box (edges inclusive)
    pub fn is_within(&self, page: &PageBox) -> bool {
        let (left, right) = (page.left.min(page.right), page.left.max(page.right));
        let (bottom, top) = (page.bottom.min(page.top), page.bottom.max(page.top));
        self.x0 >= left && self.x1 <= right && self.y0 >= bottom && self.y1 <= top
    }

    /// `[x0 y0 x1 y1]` as stored in an annotation's `/Rect`
    pub fn to_array(&self) -> [f64; 4] {
        [self.x0, self.y0, self.x1, self.y1]
    }
}

/// Map a normalized, top-left-origin box onto a page's own coordinate space.
///
/// The page height is taken as `bottom - top`, which is negative for a
/// regular box; it is only ever used as a scale factor. The image-space
/// bottom edge (`y1`) lands on the PDF rectangle's lower edge because the two
/// y axes point in opposite directions.
pub fn page_rect(bbox: &BoundingBox, page: &PageBox) -> PdfRect {
    let page_width = page.right - page.left;
    let page_height = page.bottom - page.top;

    let x0 = page.left + bbox.x0 * page_width;
    let x1 = page.left + bbox.x1 * page_width;
    let y0 = page.top + bbox.y1 * page_height;
    let y1 = page.top + bbox.y0 * page_height;

    PdfRect::normalized(x0, y0, x1, y1)
}
