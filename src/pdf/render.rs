//! Page rasterization with PDFium

use super::ensure_pdf_header;
use crate::error::{Error, Result};
use image::RgbImage;
use pdfium_render::prelude::*;

/// Default raster width in pixels for detection input
pub const DEFAULT_RENDER_WIDTH: u16 = 1600;

/// A rendered page image
#[derive(Debug, Clone)]
pub struct Page {
    /// Page index (0-indexed)
    pub index: usize,
    /// RGB raster of the page's crop box
    pub image: RgbImage,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

impl Page {
    pub fn new(index: usize, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            index,
            image,
            width,
            height,
        }
    }
}

/// Turns a PDF into one raster per page.
///
/// A password-protected document must surface [`Error::EncryptedDocument`].
pub trait PageRenderer: Send + Sync {
    fn render(&self, data: &[u8]) -> Result<Vec<Page>>;
}

/// Get PDFium instance (creates new instance each time - PDFium is not thread-safe)
fn create_pdfium() -> Result<Pdfium> {
    // Try to bind to system library or use static linking
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
                "/opt/pdfium/lib",
            ))
        })
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| Error::Pdfium {
            reason: format!("Failed to initialize PDFium: {}", e),
        })?;

    Ok(Pdfium::new(bindings))
}

/// Map PDFium errors to our error type
pub(crate) fn map_pdfium_error(err: PdfiumError) -> Error {
    match err {
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
            Error::EncryptedDocument
        }
        _ => Error::Pdfium {
            reason: format!("{}", err),
        },
    }
}

/// Renders every page with PDFium at a fixed target width
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    target_width: u16,
}

impl PdfiumRenderer {
    pub fn new() -> Self {
        Self::with_target_width(DEFAULT_RENDER_WIDTH)
    }

    pub fn with_target_width(target_width: u16) -> Self {
        Self { target_width }
    }
}

impl Default for PdfiumRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PageRenderer for PdfiumRenderer {
    fn render(&self, data: &[u8]) -> Result<Vec<Page>> {
        ensure_pdf_header(data)?;

        let pdfium = create_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(data, None)
            .map_err(map_pdfium_error)?;

        let config = PdfRenderConfig::new()
            .set_target_width(self.target_width as i32)
            .render_form_data(true)
            .render_annotations(true);

        let mut rendered = Vec::new();
        for (index, page) in document.pages().iter().enumerate() {
            let bitmap = page
                .render_with_config(&config)
                .map_err(|e| Error::Pdfium {
                    reason: format!("Failed to render page {}: {}", index + 1, e),
                })?;

            let image = bitmap.as_image().to_rgb8();
            tracing::debug!(
                page = index,
                width = image.width(),
                height = image.height(),
                "rendered page"
            );
            rendered.push(Page::new(index, image));
        }

        Ok(rendered)
    }
}
