//! FFDNet inference with ONNX Runtime
//!
//! The model is a YOLO-style detector with three classes. Its single output
//! tensor is laid out `[1, 4 + classes, anchors]`: rows 0..4 hold the box as
//! `(cx, cy, w, h)` in letterboxed input pixels, the remaining rows hold one
//! score per class.

use super::{DetectParams, DetectionMap, FieldDetector, SharedSession};
use crate::error::{Error, Result};
use crate::form::{Widget, WidgetType};
use crate::geometry::BoundingBox;
use crate::pdf::Page;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::value::TensorRef;

const PAD_VALUE: u8 = 114;
const BOX_FEATURES: usize = 4;
const MAX_DETECTIONS: usize = 300;

/// `(scale, horizontal flip)` for each inference pass
const AUGMENTED_PASSES: [(f64, bool); 3] = [(1.0, false), (0.83, true), (0.67, false)];
const SINGLE_PASS: [(f64, bool); 1] = [(1.0, false)];

/// A widget together with the class score it was detected with
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredWidget {
    pub widget: Widget,
    pub score: f32,
}

/// Placement of a resized page inside the square model input
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    ratio: f64,
    pad_x: f64,
    pad_y: f64,
}

impl Letterbox {
    /// Map a point in model input pixels back to page image pixels
    fn unmap(&self, x: f64, y: f64) -> (f64, f64) {
        ((x - self.pad_x) / self.ratio, (y - self.pad_y) / self.ratio)
    }
}

/// Resize `image` to `scale * canvas` along its long side and center it on a
/// gray square canvas.
fn letterbox(image: &RgbImage, canvas: u32, scale: f64) -> (RgbImage, Letterbox) {
    let (width, height) = image.dimensions();
    let target = (canvas as f64 * scale).round().max(1.0);
    let ratio = target / width.max(height) as f64;

    let new_width = ((width as f64 * ratio).round() as u32).clamp(1, canvas);
    let new_height = ((height as f64 * ratio).round() as u32).clamp(1, canvas);
    let pad_x = (canvas - new_width) / 2;
    let pad_y = (canvas - new_height) / 2;

    let resized = imageops::resize(image, new_width, new_height, FilterType::Triangle);
    let mut padded = RgbImage::from_pixel(canvas, canvas, Rgb([PAD_VALUE; 3]));
    imageops::replace(&mut padded, &resized, pad_x as i64, pad_y as i64);

    (
        padded,
        Letterbox {
            ratio,
            pad_x: pad_x as f64,
            pad_y: pad_y as f64,
        },
    )
}

/// NCHW float tensor in [0, 1]
fn to_tensor(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut input = Array4::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        input[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
        input[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
        input[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
    }

    input
}

/// How one inference pass relates to the page image
#[derive(Debug, Clone, Copy)]
struct PassGeometry {
    page: usize,
    letterbox: Letterbox,
    flipped: bool,
    width: f64,
    height: f64,
}

fn inference_error<E: std::fmt::Display>(e: E) -> Error {
    Error::Inference {
        reason: e.to_string(),
    }
}

/// Turn a raw output tensor into widgets normalized to the page image
fn decode(
    data: &[f32],
    dims: &[i64],
    pass: &PassGeometry,
    confidence: f32,
) -> Result<Vec<ScoredWidget>> {
    let [batch, features, anchors] = dims else {
        return Err(inference_error(format!(
            "Expected 3D output tensor, got {}D",
            dims.len()
        )));
    };
    if *batch != 1 || *features <= BOX_FEATURES as i64 || *anchors < 0 {
        return Err(inference_error(format!(
            "Unexpected output shape {:?}",
            dims
        )));
    }

    let features = *features as usize;
    let anchors = *anchors as usize;
    let classes = features - BOX_FEATURES;
    if classes > WidgetType::ALL.len() {
        return Err(Error::InvalidDetectorOutput {
            page: pass.page,
            class_id: classes - 1,
        });
    }
    if classes < WidgetType::ALL.len() {
        return Err(inference_error(format!(
            "Model predicts {} classes, expected {}",
            classes,
            WidgetType::ALL.len()
        )));
    }
    if data.len() < features * anchors {
        return Err(inference_error("Output tensor is truncated"));
    }

    let mut widgets = Vec::new();
    for anchor in 0..anchors {
        let feature = |row: usize| data[row * anchors + anchor];

        let (class_id, score) = (0..classes)
            .map(|class| (class, feature(BOX_FEATURES + class)))
            .fold((0, f32::NEG_INFINITY), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });
        if score < confidence {
            continue;
        }

        let (cx, cy) = (feature(0) as f64, feature(1) as f64);
        let (half_w, half_h) = (feature(2) as f64 / 2.0, feature(3) as f64 / 2.0);
        let (mut x0, y0) = pass.letterbox.unmap(cx - half_w, cy - half_h);
        let (mut x1, y1) = pass.letterbox.unmap(cx + half_w, cy + half_h);
        if pass.flipped {
            (x0, x1) = (pass.width - x1, pass.width - x0);
        }

        let bounding_box = BoundingBox::new(
            x0 / pass.width,
            y0 / pass.height,
            x1 / pass.width,
            y1 / pass.height,
        )
        .clamped();

        widgets.push(ScoredWidget {
            widget: Widget::from_detection(pass.page, class_id, bounding_box)?,
            score,
        });
    }

    Ok(widgets)
}

/// Greedy per-class non-maximum suppression.
///
/// Candidates are visited by descending score; one is dropped when it
/// overlaps an already kept box of the same type by more than
/// `iou_threshold`. A threshold of 1.0 keeps everything.
pub fn non_max_suppression(mut candidates: Vec<ScoredWidget>, iou_threshold: f64) -> Vec<ScoredWidget> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<ScoredWidget> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.widget.widget_type == candidate.widget.widget_type
                && k.widget.bounding_box.iou(&candidate.widget.bounding_box) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept.truncate(MAX_DETECTIONS);
    kept
}

/// [`FieldDetector`] backed by an FFDNet ONNX session
pub struct FfdNetDetector {
    session: SharedSession,
}

impl FfdNetDetector {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    fn infer(&self, input: &Array4<f32>) -> Result<(Vec<i64>, Vec<f32>)> {
        let tensor = TensorRef::from_array_view(input.view()).map_err(inference_error)?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(inference_error)?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(inference_error)?;

        Ok((shape.to_vec(), data.to_vec()))
    }

    fn detect_page(&self, page: &Page, params: &DetectParams) -> Result<Vec<Widget>> {
        if page.width == 0 || page.height == 0 {
            return Ok(Vec::new());
        }

        let canvas = params.effective_image_size();
        let passes: &[(f64, bool)] = if params.fast {
            &SINGLE_PASS
        } else {
            &AUGMENTED_PASSES
        };

        let mut candidates = Vec::new();
        for &(scale, flipped) in passes {
            let mirrored;
            let source = if flipped {
                mirrored = imageops::flip_horizontal(&page.image);
                &mirrored
            } else {
                &page.image
            };

            let (input_image, letterbox) = letterbox(source, canvas, scale);
            let (dims, data) = self.infer(&to_tensor(&input_image))?;
            let pass = PassGeometry {
                page: page.index,
                letterbox,
                flipped,
                width: page.width as f64,
                height: page.height as f64,
            };
            candidates.extend(decode(&data, &dims, &pass, params.confidence)?);
        }

        let raw = candidates.len();
        let kept = non_max_suppression(candidates, params.iou_threshold());
        tracing::debug!(page = page.index, raw, kept = kept.len(), "detected widgets");

        Ok(kept.into_iter().map(|scored| scored.widget).collect())
    }
}

impl FieldDetector for FfdNetDetector {
    fn detect(&self, pages: &[Page], params: &DetectParams) -> Result<DetectionMap> {
        params.validate()?;

        let mut detections = DetectionMap::new();
        for page in pages {
            let widgets = self.detect_page(page, params)?;
            if !widgets.is_empty() {
                detections.insert(page.index, widgets);
            }
        }
        Ok(detections)
    }
}
