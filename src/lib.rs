//! Fillable-form preparation for flat PDFs
//!
//! Pages are rendered and passed to a form-field detector; detected widgets
//! are put in reading order, mapped into PDF user space and written back as
//! AcroForm fields. The crate also ships an MCP server exposing:
//! - `prepare_form`: Detect fields and write a fillable PDF
//! - `detect_fields`: Preview detected fields without modifying the PDF
//! - `apply_fields`: Add a reviewed set of fields to a PDF

pub mod detect;
pub mod error;
pub mod form;
pub mod geometry;
pub mod pdf;
pub mod pipeline;
pub mod server;

pub use error::{Error, Result};
pub use pipeline::{prepare_form, prepare_form_with, FormOptions, FormPipeline, PreparedForm};
pub use server::{run_server, run_server_with_config, FormServer, PdfSource, ServerConfig};
