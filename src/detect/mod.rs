//! Form-field detection on rendered pages
//!
//! The pipeline only depends on the [`FieldDetector`] trait. [`FfdNetDetector`]
//! is the production implementation backed by an ONNX Runtime session; tests
//! plug in fixed detections instead.

mod model;
mod onnx;

pub use crate::form::DetectionMap;
pub use model::{Device, ModelCache, ModelSource, ModelStore, Preset, SharedSession, DEFAULT_MODEL};
pub use onnx::{non_max_suppression, FfdNetDetector, ScoredWidget};

use crate::error::{Error, Result};
use crate::pdf::Page;

/// Image size used by fast mode, whatever size was requested
pub const FAST_IMAGE_SIZE: u32 = 1216;

/// Accepted range for a requested model input size
pub const MIN_IMAGE_SIZE: u32 = 32;
pub const MAX_IMAGE_SIZE: u32 = 4096;

/// Detector-facing subset of the pipeline options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Minimum class score for a prediction to be kept
    pub confidence: f32,
    /// Square model input size in pixels (standard mode)
    pub image_size: u32,
    /// Single pass, no suppression of overlapping boxes
    pub fast: bool,
}

impl DetectParams {
    /// Reject sizes the letterbox cannot work with and scores that can never
    /// compare meaningfully
    pub fn validate(&self) -> Result<()> {
        if !(MIN_IMAGE_SIZE..=MAX_IMAGE_SIZE).contains(&self.image_size) {
            return Err(Error::InvalidOption {
                reason: format!(
                    "image_size must be between {} and {}, got {}",
                    MIN_IMAGE_SIZE, MAX_IMAGE_SIZE, self.image_size
                ),
            });
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::InvalidOption {
                reason: format!("confidence must be between 0 and 1, got {}", self.confidence),
            });
        }
        Ok(())
    }

    /// Input size actually fed to the model
    pub fn effective_image_size(&self) -> u32 {
        if self.fast {
            FAST_IMAGE_SIZE
        } else {
            self.image_size
        }
    }

    /// IoU above which a lower-scored box of the same class is suppressed
    pub fn iou_threshold(&self) -> f64 {
        if self.fast {
            1.0
        } else {
            0.1
        }
    }
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            confidence: 0.3,
            image_size: 1600,
            fast: false,
        }
    }
}

/// Finds form fields on rendered pages.
///
/// Implementations return boxes normalized to each page image and never emit
/// widget types outside [`crate::form::WidgetType`]; unknown classes fail the
/// call with [`crate::Error::InvalidDetectorOutput`].
pub trait FieldDetector: Send + Sync {
    fn detect(&self, pages: &[Page], params: &DetectParams) -> Result<DetectionMap>;
}
