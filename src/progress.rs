//! Progress-callback trait for per-page pipeline events.
//!
//! Inject an [`Arc<dyn ProgressCallback>`] via
//! [`crate::config::MarginConfigBuilder::progress_callback`] to receive events
//! while pages are rasterised and composed. Both stages fan pages out to
//! blocking worker threads, so the trait is `Send + Sync` and events for
//! different pages may arrive concurrently and out of page order.
//!
//! # Example
//!
//! ```rust
//! use pdfmargin::{MarginConfig, ProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl ProgressCallback for Counter {
//!     fn on_page_complete(&self, stage: Stage, page_num: usize, total_pages: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage}: page {page_num}/{total_pages}");
//!     }
//! }
//!
//! let config = MarginConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which pipeline stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Source PDF pages → raster images.
    Rasterize,
    /// Raster images → output PDF with margins.
    Compose,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Rasterize => f.write_str("rasterize"),
            Stage::Compose => f.write_str("compose"),
        }
    }
}

/// Called by the pipeline as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Page numbers are 1-indexed.
pub trait ProgressCallback: Send + Sync {
    /// Called once per stage before any page is processed.
    fn on_stage_start(&self, stage: Stage, total_pages: usize) {
        let _ = (stage, total_pages);
    }

    /// Called when one page finished successfully.
    fn on_page_complete(&self, stage: Stage, page_num: usize, total_pages: usize) {
        let _ = (stage, page_num, total_pages);
    }

    /// Called when one page failed. The stage as a whole fails afterwards.
    fn on_page_error(&self, stage: Stage, page_num: usize, total_pages: usize, error: &str) {
        let _ = (stage, page_num, total_pages, error);
    }

    /// Called once per stage after every page has been attempted.
    fn on_stage_complete(&self, stage: Stage, total_pages: usize, success_count: usize) {
        let _ = (stage, total_pages, success_count);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl ProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::MarginConfig`].
pub type SharedProgress = Arc<dyn ProgressCallback>;
