//! MCP Server implementation using rmcp

use crate::detect::{FieldDetector, ModelCache, ModelSource, ModelStore};
use crate::form::{PlacedField, Widget};
use crate::pdf::{PageRenderer, PdfiumRenderer};
use crate::pipeline::{load_detector, write_output, FormOptions, FormPipeline, PreparedForm};
use anyhow::Result;
use base64::Engine;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters, model::*,
    schemars::JsonSchema, tool, tool_handler, tool_router, ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// PDF source specification
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum PdfSource {
    /// File path (absolute or relative)
    Path {
        /// Path to the PDF file
        path: String,
    },
    /// Base64 encoded PDF data
    Base64 {
        /// Base64 encoded PDF content
        base64: String,
    },
}

impl<'de> serde::Deserialize<'de> for PdfSource {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;

        let Some(obj) = value.as_object() else {
            return Err(serde::de::Error::custom(
                "Invalid source: expected an object with \"path\" or \"base64\"",
            ));
        };

        match (obj.get("path"), obj.get("base64")) {
            (Some(serde_json::Value::String(path)), _) => Ok(PdfSource::Path { path: path.clone() }),
            (Some(_), _) => Err(serde::de::Error::custom("\"path\" must be a string")),
            (None, Some(serde_json::Value::String(base64))) => Ok(PdfSource::Base64 {
                base64: base64.clone(),
            }),
            (None, Some(_)) => Err(serde::de::Error::custom("\"base64\" must be a string")),
            (None, None) => {
                let keys: Vec<&String> = obj.keys().collect();
                Err(serde::de::Error::custom(format!(
                    "Invalid source: expected an object with \"path\" or \"base64\", but got keys: {:?}",
                    keys
                )))
            }
        }
    }
}

/// Security and resource configuration for the form server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directories inputs and outputs must live under (empty allows all)
    pub resource_dirs: Vec<String>,
    /// Where downloaded model weights are kept
    pub model_dir: PathBuf,
    /// Maximum number of loaded model sessions (default: 4)
    pub model_cache_entries: usize,
    /// Maximum model download size in bytes (default: 512MB)
    pub max_download_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            resource_dirs: Vec::new(),
            model_dir: ModelStore::default_dir(),
            model_cache_entries: 4,
            max_download_bytes: 512 * 1024 * 1024, // 512MB
        }
    }
}

/// Fillable-form MCP Server
#[derive(Clone)]
pub struct FormServer {
    tool_router: ToolRouter<Self>,
    config: Arc<ServerConfig>,
    models: Arc<ModelCache>,
    store: ModelStore,
    renderer: Arc<dyn PageRenderer>,
    detector: Option<Arc<dyn FieldDetector>>,
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PrepareFormParams {
    /// PDF to convert
    pub source: PdfSource,
    /// Where to write the fillable PDF. Omit to receive it as base64.
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(flatten)]
    pub options: FormOptions,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DetectFieldsParams {
    /// PDF to analyze
    pub source: PdfSource,
    #[serde(flatten)]
    pub options: FormOptions,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ApplyFieldsParams {
    /// PDF to add fields to
    pub source: PdfSource,
    /// Widgets to materialize, typically an edited `detect_fields` result
    pub widgets: Vec<Widget>,
    /// Where to write the fillable PDF. Omit to receive it as base64.
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(flatten)]
    pub options: FormOptions,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct FormResult {
    /// Source identifier
    pub source: String,
    /// Fields added to the document, in tab order
    pub fields: Vec<PlacedField>,
    /// Path the document was written to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Base64 encoded document when no output path was given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct DetectFieldsResult {
    /// Source identifier
    pub source: String,
    /// Detected fields with their planned names and page rectangles
    pub fields: Vec<PlacedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ResolvedPdf {
    data: Vec<u8>,
    source_name: String,
}

// ============================================================================
// Tool implementations
// ============================================================================

#[tool_router]
impl FormServer {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a new FormServer with full configuration
    pub fn with_config(config: ServerConfig) -> Self {
        let store = ModelStore::new(config.model_dir.clone(), config.max_download_bytes);
        Self {
            tool_router: Self::tool_router(),
            models: Arc::new(ModelCache::new(config.model_cache_entries)),
            store,
            config: Arc::new(config),
            renderer: Arc::new(PdfiumRenderer::new()),
            detector: None,
        }
    }

    /// Replace the rendering and detection backends
    pub fn with_backends(
        mut self,
        renderer: Arc<dyn PageRenderer>,
        detector: Arc<dyn FieldDetector>,
    ) -> Self {
        self.renderer = renderer;
        self.detector = Some(detector);
        self
    }

    /// Convert a flat PDF into a fillable form
    #[tool(
        description = "Detect form fields in a flat PDF and turn it into a fillable form with text, checkbox and signature fields in reading order.

Source format: {\"path\": \"/absolute/path.pdf\"} or {\"base64\": \"...\"}"
    )]
    async fn prepare_form(&self, Parameters(params): Parameters<PrepareFormParams>) -> String {
        let result = self
            .process_prepare_form(&params)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "prepare_form failed");
                FormResult::failed(Self::source_name(&params.source), e)
            });

        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Detect form fields without modifying the PDF
    #[tool(
        description = "Detect form fields in a PDF without modifying it. Returns each field's planned name, type, normalized box and PDF rectangle in tab order. Pass an edited list to apply_fields.

Source format: {\"path\": \"/absolute/path.pdf\"} or {\"base64\": \"...\"}"
    )]
    async fn detect_fields(&self, Parameters(params): Parameters<DetectFieldsParams>) -> String {
        let result = self
            .process_detect_fields(&params)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "detect_fields failed");
                DetectFieldsResult {
                    source: Self::source_name(&params.source),
                    fields: vec![],
                    error: Some(e.client_message()),
                }
            });

        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// Add a caller-chosen set of fields to a PDF
    #[tool(
        description = "Add the given widgets to a PDF as form fields. Widgets use normalized boxes (0-1, top-left origin) on 0-indexed pages, as returned by detect_fields.

Source format: {\"path\": \"/absolute/path.pdf\"} or {\"base64\": \"...\"}"
    )]
    async fn apply_fields(&self, Parameters(params): Parameters<ApplyFieldsParams>) -> String {
        let result = self
            .process_apply_fields(&params)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "apply_fields failed");
                FormResult::failed(Self::source_name(&params.source), e)
            });

        serde_json::to_string_pretty(&result).unwrap_or_default()
    }
}

impl Default for FormServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FormResult {
    fn failed(source: String, error: crate::error::Error) -> Self {
        Self {
            source,
            fields: vec![],
            output_path: None,
            output_base64: None,
            error: Some(error.client_message()),
        }
    }
}

impl FormServer {
    fn source_name(source: &PdfSource) -> String {
        match source {
            PdfSource::Path { path } => path.clone(),
            PdfSource::Base64 { .. } => "<base64>".to_string(),
        }
    }

    async fn resolve_source(&self, source: &PdfSource) -> crate::error::Result<ResolvedPdf> {
        let resolved = match source {
            PdfSource::Path { path } => {
                let allowed = self.validate_path_access(path)?;
                let data = tokio::fs::read(&allowed).await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => crate::error::Error::PdfNotFound {
                        path: path.clone(),
                    },
                    _ => crate::error::Error::Io(e),
                })?;
                ResolvedPdf {
                    data,
                    source_name: path.clone(),
                }
            }
            PdfSource::Base64 { base64 } => {
                let engine = base64::engine::general_purpose::STANDARD;
                ResolvedPdf {
                    data: engine.decode(base64)?,
                    source_name: "<base64>".to_string(),
                }
            }
        };

        crate::pdf::ensure_pdf_header(&resolved.data)?;
        Ok(resolved)
    }

    /// Validate that a path is within allowed resource directories.
    /// If no resource_dirs are configured, all paths are allowed.
    fn validate_path_access(&self, path: &str) -> crate::error::Result<PathBuf> {
        if self.config.resource_dirs.is_empty() {
            return Ok(PathBuf::from(path));
        }

        let canonical =
            std::fs::canonicalize(path).map_err(|_| crate::error::Error::PathAccessDenied {
                path: path.to_string(),
            })?;

        self.within_resource_dirs(&canonical, path)
    }

    /// Validate that an output path is within allowed resource directories.
    /// Canonicalizes the parent directory since the output file may not exist yet.
    fn validate_output_path_access(&self, path: &str) -> crate::error::Result<PathBuf> {
        if self.config.resource_dirs.is_empty() {
            return Ok(PathBuf::from(path));
        }

        let path_obj = Path::new(path);
        let parent = match path_obj.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let canonical_parent =
            std::fs::canonicalize(parent).map_err(|_| crate::error::Error::PathAccessDenied {
                path: path.to_string(),
            })?;
        let canonical_target =
            canonical_parent.join(path_obj.file_name().unwrap_or(std::ffi::OsStr::new("")));

        self.within_resource_dirs(&canonical_target, path)
    }

    fn within_resource_dirs(
        &self,
        canonical: &Path,
        requested: &str,
    ) -> crate::error::Result<PathBuf> {
        for dir in &self.config.resource_dirs {
            if let Ok(canonical_dir) = std::fs::canonicalize(dir) {
                if canonical.starts_with(&canonical_dir) {
                    return Ok(canonical.to_path_buf());
                }
            }
        }

        Err(crate::error::Error::PathAccessDenied {
            path: requested.to_string(),
        })
    }

    /// Write the finished document, or hand it back as base64
    async fn deliver(
        &self,
        source_name: String,
        prepared: PreparedForm,
        output_path: &Option<String>,
    ) -> crate::error::Result<FormResult> {
        let (output_path, output_base64) = match output_path {
            Some(path_str) => {
                let path = self.validate_output_path_access(path_str)?;
                write_output(&path, prepared.data).await?;
                (Some(path_str.clone()), None)
            }
            None => {
                let engine = base64::engine::general_purpose::STANDARD;
                (None, Some(engine.encode(&prepared.data)))
            }
        };

        Ok(FormResult {
            source: source_name,
            fields: prepared.fields,
            output_path,
            output_base64,
            error: None,
        })
    }

    /// Model files named by path are held to the same resource directories
    /// as the documents.
    async fn detector_for(
        &self,
        options: &FormOptions,
    ) -> crate::error::Result<Arc<dyn FieldDetector>> {
        let mut options = options.clone();
        if let ModelSource::Path(path) = options.model_source() {
            let allowed = self.validate_path_access(&path.to_string_lossy())?;
            options.model = allowed.to_string_lossy().into_owned();
        }

        match &self.detector {
            Some(detector) => Ok(Arc::clone(detector)),
            None => {
                let detector = load_detector(&options, &self.models, &self.store).await?;
                Ok(Arc::new(detector))
            }
        }
    }

    async fn process_prepare_form(
        &self,
        params: &PrepareFormParams,
    ) -> crate::error::Result<FormResult> {
        let resolved = self.resolve_source(&params.source).await?;
        if let Some(path) = &params.output_path {
            self.validate_output_path_access(path)?;
        }

        let detector = self.detector_for(&params.options).await?;
        let renderer = Arc::clone(&self.renderer);
        let options = params.options.clone();
        let data = resolved.data;

        // Move CPU-heavy work to blocking thread pool
        let prepared = tokio::task::spawn_blocking(move || {
            FormPipeline::new(renderer.as_ref(), detector.as_ref()).run(&data, &options)
        })
        .await
        .map_err(|e| crate::error::Error::Task {
            reason: format!("Task join error: {}", e),
        })??;

        self.deliver(resolved.source_name, prepared, &params.output_path)
            .await
    }

    async fn process_detect_fields(
        &self,
        params: &DetectFieldsParams,
    ) -> crate::error::Result<DetectFieldsResult> {
        let resolved = self.resolve_source(&params.source).await?;
        let detector = self.detector_for(&params.options).await?;
        let renderer = Arc::clone(&self.renderer);
        let options = params.options.clone();
        let data = resolved.data;

        let fields = tokio::task::spawn_blocking(move || {
            FormPipeline::new(renderer.as_ref(), detector.as_ref()).plan(&data, &options)
        })
        .await
        .map_err(|e| crate::error::Error::Task {
            reason: format!("Task join error: {}", e),
        })??;

        Ok(DetectFieldsResult {
            source: resolved.source_name,
            fields,
            error: None,
        })
    }

    async fn process_apply_fields(
        &self,
        params: &ApplyFieldsParams,
    ) -> crate::error::Result<FormResult> {
        let resolved = self.resolve_source(&params.source).await?;
        if let Some(path) = &params.output_path {
            self.validate_output_path_access(path)?;
        }

        let widgets = params.widgets.clone();
        let options = params.options.clone();
        let data = resolved.data;

        let prepared =
            tokio::task::spawn_blocking(move || FormPipeline::apply(&data, widgets, &options))
                .await
                .map_err(|e| crate::error::Error::Task {
                    reason: format!("Task join error: {}", e),
                })??;

        self.deliver(resolved.source_name, prepared, &params.output_path)
            .await
    }
}

#[tool_handler]
impl ServerHandler for FormServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Form server turns flat PDFs into fillable forms. Use detect_fields to preview, \
                 apply_fields to add a reviewed set of fields, or prepare_form to do both at once."
                    .into(),
            ),
        }
    }
}

/// Run the MCP server without resource directories
pub async fn run_server() -> Result<()> {
    run_server_with_config(ServerConfig::default()).await
}

/// Run the MCP server with full configuration
pub async fn run_server_with_config(config: ServerConfig) -> Result<()> {
    let server = FormServer::with_config(config);

    tracing::info!("Form server ready, waiting for connections...");

    let service = server.serve(rmcp::transport::io::stdio()).await?;
    service.waiting().await?;

    Ok(())
}
