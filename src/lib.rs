//! # pdfmargin
//!
//! Add blank margins around every page of a PDF.
//!
//! Each page of the source is rasterised, then drawn inset on a larger page
//! so that the requested top/bottom/left/right bands stay empty. The result
//! is written to a cache directory and handed back as a shareable URI.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input    read file or in-memory bytes, check %PDF magic
//!  ├─ 2. Render   rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Compose  inset each raster on a (l+w+r) × (t+h+b) page via lopdf
//!  └─ 4. Share    <name>.pdf in the cache dir + content:// or file:// URI
//! ```
//!
//! Both per-page stages fan out with bounded concurrency and collect results
//! back into page order before anything is published.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdfmargin::{add_margins, EdgeInsets, MarginConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MarginConfig::default();
//!     let out = add_margins("scan.pdf", EdgeInsets::new(10, 20, 5, 5), "scan", &config).await?;
//!     println!("{} ({} pages)", out.path.display(), out.page_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Interactive flow
//!
//! [`WizardController`] owns a single [`Job`] and reacts to
//! [`WizardEvent`]s (select source, edit margins/name, compose). Readers
//! subscribe to whole-job snapshots and a notification channel.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfmargin` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdfmargin = { version = "0.1", default-features = false }
//! ```
//!
//! ## Units
//!
//! Margins are canvas units: one raster pixel, drawn as one PDF point. At the
//! default 72 DPI a raster pixel is exactly one source point, so output pages
//! keep the physical size of the source pages plus the margins. Use
//! [`EdgeInsets::from_millimetres`] to enter margins in millimetres.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod controller;
pub mod convert;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{MarginConfig, MarginConfigBuilder};
pub use controller::{Notification, WizardController, WizardEvent};
pub use convert::{
    add_margins, add_margins_sync, add_margins_with_backend, inspect, inspect_with_backend,
    DocumentInfo,
};
pub use error::MarginError;
pub use job::{
    Activity, Edge, EdgeInsets, Job, JobSummary, Margins, OutputHandle, Phase, RasterImage,
    RasterPage, SourceHandle,
};
pub use pipeline::compose::MarginComposer;
pub use pipeline::render::{DocumentSession, PageRasterizer, PdfBackend, PdfiumBackend, RenderOptions};
pub use progress::{NoopProgressCallback, ProgressCallback, Stage};
