//! PDF processing layer
//!
//! Rendering goes through PDFium; the form-field structure is edited with lopdf.

mod document;
mod render;

pub use document::{FormDocument, WidgetAnnotation};
pub use render::{Page, PageRenderer, PdfiumRenderer, DEFAULT_RENDER_WIDTH};

use crate::error::{Error, Result};

/// Reject buffers that do not start with a PDF header
pub(crate) fn ensure_pdf_header(data: &[u8]) -> Result<()> {
    if data.len() < 4 || &data[0..4] != b"%PDF" {
        return Err(Error::InvalidPdf {
            reason: "Not a valid PDF file".to_string(),
        });
    }
    Ok(())
}
