//! Error types for the pdfmargin library.
//!
//! A single enum, [`MarginError`], covers every failure the two pipeline
//! stages and the wizard controller can report. The controller never lets one
//! of these escape as a panic: failures inside an asynchronous operation are
//! caught at its boundary and turned into state flags plus a
//! [`crate::controller::Notification`].
//!
//! The variants fall into four groups:
//!
//! * **Source**: the input could not be read or is not a usable PDF.
//! * **Render**: the PDF backend failed on a page, or the rendering session
//!   was closed under it.
//! * **Compose**: the output name is unusable, or the composed document
//!   could not be encoded, serialised or written.
//! * **Setup**: invalid configuration, pdfium binding, controller shutdown.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the pdfmargin library.
#[derive(Debug, Error)]
pub enum MarginError {
    // ── Source errors ─────────────────────────────────────────────────────
    /// The source could not be opened (missing file, revoked permission…).
    #[error("Cannot open PDF source '{source_name}': {reason}")]
    SourceUnreadable { source_name: String, reason: String },

    /// The source was read, but does not start with the `%PDF` magic bytes.
    #[error("Source '{source_name}' is not a PDF\nFirst bytes: {magic:?}")]
    NotAPdf { source_name: String, magic: [u8; 4] },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{source_name}' is corrupt: {detail}")]
    CorruptPdf { source_name: String, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{source_name}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { source_name: String },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{source_name}'")]
    WrongPassword { source_name: String },

    // ── Render errors ─────────────────────────────────────────────────────
    /// The PDF backend returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// A newer rasterisation closed the session this page belonged to.
    #[error("Rendering session closed before page {page} was rendered")]
    SessionClosed { page: usize },

    // ── Compose errors ────────────────────────────────────────────────────
    /// The output name is empty or whitespace only.
    #[error("Output name must not be empty")]
    EmptyOutputName,

    /// The output name cannot be used as a file name.
    #[error("Invalid output name '{name}': {reason}")]
    InvalidOutputName { name: String, reason: String },

    /// A page raster could not be encoded as a PDF image.
    #[error("Failed to encode page {page}: {detail}")]
    EncodeFailed { page: usize, detail: String },

    /// lopdf could not serialise the composed document.
    #[error("Failed to serialise composed PDF: {0}")]
    SerializeFailed(String),

    /// Could not create or write the output PDF file.
    #[error("Failed to write output file '{path}': {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Setup errors ──────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium, or place the platform library\n\
next to the executable or in the working directory.\n"
    )]
    PdfiumBindingFailed(String),

    /// The wizard controller task is no longer running.
    #[error("Wizard controller has shut down")]
    ControllerClosed,

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MarginError {
    /// True for failures caused by the input document.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            MarginError::SourceUnreadable { .. }
                | MarginError::NotAPdf { .. }
                | MarginError::CorruptPdf { .. }
                | MarginError::PasswordRequired { .. }
                | MarginError::WrongPassword { .. }
        )
    }

    /// True when the composed document could not be produced or stored.
    pub fn is_write_error(&self) -> bool {
        matches!(
            self,
            MarginError::WriteFailure { .. }
                | MarginError::SerializeFailed(_)
                | MarginError::EncodeFailed { .. }
        )
    }
}
