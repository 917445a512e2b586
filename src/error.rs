//! Error types for pdf-formify

use thiserror::Error;

/// Result type alias for pdf-formify
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for pdf-formify
#[derive(Error, Debug)]
pub enum Error {
    /// The source document needs a password before it can be rendered
    #[error("PDF is password protected")]
    EncryptedDocument,

    /// PDF file not found
    #[error("PDF not found: {path}")]
    PdfNotFound { path: String },

    /// Invalid PDF file
    #[error("Invalid PDF file: {reason}")]
    InvalidPdf { reason: String },

    /// Page out of bounds (0-indexed page)
    #[error("Page {page} out of bounds (total: {total})")]
    PageOutOfBounds { page: usize, total: usize },

    /// The detector produced a class id outside the known field kinds
    #[error("Detector emitted unknown class id {class_id} on page {page}")]
    InvalidDetectorOutput { page: usize, class_id: usize },

    /// Two fields would end up with the same fully-qualified name
    #[error("Form field name already in use: {name}")]
    FieldNameCollision { name: String },

    /// A pipeline option is outside its accepted range
    #[error("Invalid option: {reason}")]
    InvalidOption { reason: String },

    /// Document object model error (lopdf)
    #[error("PDF document error: {reason}")]
    Document { reason: String },

    /// PDFium error
    #[error("PDFium error: {reason}")]
    Pdfium { reason: String },

    /// Model weights could not be loaded into a session
    #[error("Model error: {reason}")]
    Model { reason: String },

    /// Inference failed or returned an unexpected tensor
    #[error("Inference error: {reason}")]
    Inference { reason: String },

    /// Model weights could not be fetched
    #[error("Model download failed: {reason}")]
    ModelDownload { reason: String },

    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// Base64 decode error
    #[error("Invalid base64 data: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking worker task panicked or was cancelled
    #[error("Background task failed: {reason}")]
    Task { reason: String },

    /// Path access denied (outside allowed resource directories)
    #[error("Path access denied: {path}")]
    PathAccessDenied { path: String },
}

impl Error {
    /// Whether this error is the distinct "document needs a password" condition.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Error::EncryptedDocument)
    }

    /// Return a sanitized error message safe to send to clients.
    /// Internal details (paths, library errors) are omitted.
    /// Full details should be logged via tracing before calling this.
    pub fn client_message(&self) -> String {
        match self {
            Error::EncryptedDocument => "PDF is password protected".to_string(),
            Error::PdfNotFound { .. } => "PDF not found".to_string(),
            Error::InvalidPdf { .. } => "Invalid PDF file".to_string(),
            Error::PageOutOfBounds { page, total } => {
                format!("Page {} out of bounds (total: {})", page, total)
            }
            Error::InvalidDetectorOutput { class_id, .. } => {
                format!("Detector emitted unknown class id {}", class_id)
            }
            Error::FieldNameCollision { name } => {
                format!("Form field name already in use: {}", name)
            }
            Error::InvalidOption { reason } => format!("Invalid option: {}", reason),
            Error::Document { .. } => "PDF processing error".to_string(),
            Error::Pdfium { .. } => "PDF processing error".to_string(),
            Error::Model { .. } => "Failed to load detection model".to_string(),
            Error::Inference { .. } => "Field detection failed".to_string(),
            Error::ModelDownload { .. } => "Failed to download model weights".to_string(),
            Error::HttpRequest(_) => "HTTP request failed".to_string(),
            Error::Base64Decode(_) => "Invalid base64 data".to_string(),
            Error::Io(_) => "I/O error".to_string(),
            Error::Serialization(_) => "Serialization error".to_string(),
            Error::Task { .. } => "Internal error".to_string(),
            Error::PathAccessDenied { .. } => "Access denied".to_string(),
        }
    }
}
