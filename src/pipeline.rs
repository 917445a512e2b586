//! Flat PDF to fillable form
//!
//! Stages run strictly in order: Render, Detect, Sort/MapRect per page,
//! Materialize, Persist. Every failure aborts the run and nothing is written
//! until the whole document has been serialized.

use crate::detect::{
    DetectParams, DetectionMap, Device, FfdNetDetector, FieldDetector, ModelCache, ModelSource,
    ModelStore, DEFAULT_MODEL,
};
use crate::error::{Error, Result};
use crate::form::{plan_fields, PlacedField, Widget};
use crate::pdf::{FormDocument, PageRenderer, PdfiumRenderer};
use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FormOptions {
    /// Detector preset (`FFDNet-S`, `FFDNet-L`) or path to an ONNX file
    pub model: String,
    /// Keep form fields already present in the document
    pub keep_existing_fields: bool,
    /// Create signature fields for detected signatures (text fields otherwise)
    pub use_signature_fields: bool,
    /// `cpu`, `cuda`, `cuda:N` or a GPU index
    pub device: String,
    /// Model input size in pixels (ignored in fast mode)
    pub image_size: u32,
    /// Minimum detection confidence
    pub confidence: f32,
    /// Single inference pass at a fixed size, no box suppression
    pub fast: bool,
    /// Create multi-line text fields
    pub multiline_text_fields: bool,
}

impl Default for FormOptions {
    fn default() -> Self {
        let params = DetectParams::default();
        Self {
            model: DEFAULT_MODEL.to_string(),
            keep_existing_fields: false,
            use_signature_fields: false,
            device: "cpu".to_string(),
            image_size: params.image_size,
            confidence: params.confidence,
            fast: params.fast,
            multiline_text_fields: false,
        }
    }
}

impl FormOptions {
    /// Detector parameters, rejected with [`Error::InvalidOption`] when out of range
    pub fn detect_params(&self) -> Result<DetectParams> {
        let params = DetectParams {
            confidence: self.confidence,
            image_size: self.image_size,
            fast: self.fast,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn model_source(&self) -> ModelSource {
        ModelSource::parse(&self.model)
    }

    pub fn device(&self) -> Result<Device> {
        self.device.parse()
    }
}

/// A fully serialized output document and the fields it gained
#[derive(Debug, Clone)]
pub struct PreparedForm {
    pub data: Vec<u8>,
    pub fields: Vec<PlacedField>,
}

/// Runs the stages against pluggable rendering and detection backends
pub struct FormPipeline<'a> {
    renderer: &'a dyn PageRenderer,
    detector: &'a dyn FieldDetector,
}

impl<'a> FormPipeline<'a> {
    pub fn new(renderer: &'a dyn PageRenderer, detector: &'a dyn FieldDetector) -> Self {
        Self { renderer, detector }
    }

    /// Render every page and run the detector over them
    pub fn detect(&self, data: &[u8], options: &FormOptions) -> Result<DetectionMap> {
        let params = options.detect_params()?;
        let pages = self.renderer.render(data)?;
        tracing::info!(pages = pages.len(), "rendered document");

        let detections = self.detector.detect(&pages, &params)?;
        tracing::info!(
            pages_with_fields = detections.len(),
            widgets = detections.values().map(Vec::len).sum::<usize>(),
            "detected form fields"
        );

        Ok(detections)
    }

    /// Detect fields and plan their names and page rectangles without
    /// touching the document
    pub fn plan(&self, data: &[u8], options: &FormOptions) -> Result<Vec<PlacedField>> {
        let detections = self.detect(data, options)?;
        let document = FormDocument::load(data)?;
        plan_fields(
            &detections,
            &document.page_boxes()?,
            options.use_signature_fields,
        )
    }

    /// Run every stage and return the serialized document
    pub fn run(&self, data: &[u8], options: &FormOptions) -> Result<PreparedForm> {
        let detections = self.detect(data, options)?;
        let document = FormDocument::load(data)?;
        materialize(document, &detections, options)
    }

    /// Materialize a caller-chosen set of widgets, skipping render and detect
    pub fn apply(data: &[u8], widgets: Vec<Widget>, options: &FormOptions) -> Result<PreparedForm> {
        let document = FormDocument::load(data)?;

        let mut detections = DetectionMap::new();
        for widget in widgets {
            detections.entry(widget.page).or_default().push(widget);
        }

        materialize(document, &detections, options)
    }
}

fn materialize(
    mut document: FormDocument,
    detections: &DetectionMap,
    options: &FormOptions,
) -> Result<PreparedForm> {
    let fields = plan_fields(
        detections,
        &document.page_boxes()?,
        options.use_signature_fields,
    )?;

    if !options.keep_existing_fields {
        document.clear_fields()?;
    }

    for field in &fields {
        document.add_field(field, options.multiline_text_fields)?;
    }
    tracing::debug!(fields = fields.len(), "materialized form fields");

    let data = document.save_to_bytes()?;
    Ok(PreparedForm { data, fields })
}

async fn read_input(input: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(input).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::PdfNotFound {
            path: input.display().to_string(),
        },
        _ => Error::Io(e),
    })
}

/// Write `data` to `path` through a temporary file in the same directory, so
/// `path` holds either its previous contents or the complete document.
pub async fn write_output(path: &Path, data: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let mut file = tempfile::Builder::new()
            .prefix(".pdf-formify-")
            .suffix(".part")
            .tempfile_in(parent)?;
        file.write_all(&data)?;
        file.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }

        file.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Task {
        reason: format!("Task join error: {}", e),
    })?
}

/// Run the pipeline on `input` with the given backends and write the result
/// to `output`.
///
/// The CPU-heavy stages run on the blocking pool. `output` is written only
/// after the whole document serialized successfully.
pub async fn prepare_form_with(
    input: &Path,
    output: &Path,
    options: &FormOptions,
    renderer: Arc<dyn PageRenderer>,
    detector: Arc<dyn FieldDetector>,
) -> Result<Vec<PlacedField>> {
    let data = read_input(input).await?;
    let options = options.clone();

    let prepared = tokio::task::spawn_blocking(move || {
        FormPipeline::new(renderer.as_ref(), detector.as_ref()).run(&data, &options)
    })
    .await
    .map_err(|e| Error::Task {
        reason: format!("Task join error: {}", e),
    })??;

    let fields = prepared.fields;
    write_output(output, prepared.data).await?;
    tracing::info!(
        output = %output.display(),
        fields = fields.len(),
        "wrote fillable form"
    );

    Ok(fields)
}

/// Resolve the configured model into a loaded detector
pub async fn load_detector(
    options: &FormOptions,
    cache: &Arc<ModelCache>,
    store: &ModelStore,
) -> Result<FfdNetDetector> {
    options.detect_params()?;
    let device = options.device()?;
    let model_path = store.resolve(&options.model_source()).await?;
    let fast = options.fast;
    let cache = Arc::clone(cache);

    let session = tokio::task::spawn_blocking(move || cache.get_or_load(&model_path, fast, device))
        .await
        .map_err(|e| Error::Task {
            reason: format!("Task join error: {}", e),
        })??;

    Ok(FfdNetDetector::new(session))
}

/// Turn the flat PDF at `input` into a fillable form at `output` using
/// PDFium rendering and the configured FFDNet model.
pub async fn prepare_form(
    input: &Path,
    output: &Path,
    options: &FormOptions,
    cache: &Arc<ModelCache>,
    store: &ModelStore,
) -> Result<Vec<PlacedField>> {
    let detector = load_detector(options, cache, store).await?;
    prepare_form_with(
        input,
        output,
        options,
        Arc::new(PdfiumRenderer::new()),
        Arc::new(detector),
    )
    .await
}
