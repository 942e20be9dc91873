//! One-shot entry points: rasterise, compose, done.
//!
//! These skip the wizard controller entirely. There is no busy state, no
//! minimum busy delay and no notifications; errors are returned directly.
//! Use [`crate::controller::WizardController`] for the interactive flow.

use crate::config::MarginConfig;
use crate::error::MarginError;
use crate::job::{EdgeInsets, OutputHandle, SourceHandle};
use crate::pipeline::compose::MarginComposer;
use crate::pipeline::input;
use crate::pipeline::render::{PageRasterizer, PdfBackend, PdfiumBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Basic facts about a source PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    /// Full source name, e.g. `report.pdf`.
    pub name: String,
    /// Name without extension; the default output name.
    pub display_name: Option<String>,
    pub page_count: usize,
    /// Size of the source in bytes.
    pub size_bytes: u64,
}

/// Add `insets` around every page of `source` and write `<output_name>.pdf`
/// into the configured cache directory.
///
/// # Example
/// ```rust,no_run
/// use pdfmargin::{add_margins, EdgeInsets, MarginConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = MarginConfig::default();
/// let out = add_margins("scan.pdf", EdgeInsets::new(10, 20, 5, 5), "scan-padded", &config).await?;
/// println!("{}", out.uri);
/// # Ok(())
/// # }
/// ```
pub async fn add_margins(
    source: impl Into<SourceHandle>,
    insets: EdgeInsets,
    output_name: &str,
    config: &MarginConfig,
) -> Result<OutputHandle, MarginError> {
    add_margins_with_backend(
        Arc::new(PdfiumBackend::new()),
        source,
        insets,
        output_name,
        config,
    )
    .await
}

/// Same as [`add_margins`] with a caller-supplied PDF backend.
pub async fn add_margins_with_backend(
    backend: Arc<dyn PdfBackend>,
    source: impl Into<SourceHandle>,
    insets: EdgeInsets,
    output_name: &str,
    config: &MarginConfig,
) -> Result<OutputHandle, MarginError> {
    let start = Instant::now();
    let source = source.into();
    // Fail on a bad name before paying for rasterisation.
    crate::pipeline::share::output_file_name(output_name)?;

    let rasterizer = PageRasterizer::new(backend, config);
    let pages = rasterizer.rasterize(&source).await;
    rasterizer.close();
    let pages = pages?;

    let output = MarginComposer::new(config)
        .compose(Arc::new(pages), insets, output_name)
        .await?;
    info!(
        "Added margins to {} in {}ms",
        source,
        start.elapsed().as_millis()
    );
    Ok(output)
}

/// Synchronous wrapper around [`add_margins`].
///
/// Creates a tokio runtime internally. Do not call from within an async
/// context.
pub fn add_margins_sync(
    source: impl Into<SourceHandle>,
    insets: EdgeInsets,
    output_name: &str,
    config: &MarginConfig,
) -> Result<OutputHandle, MarginError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| MarginError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(add_margins(source, insets, output_name, config))
}

/// Open `source` and report its page count without rendering anything.
pub async fn inspect(
    source: impl Into<SourceHandle>,
    config: &MarginConfig,
) -> Result<DocumentInfo, MarginError> {
    inspect_with_backend(Arc::new(PdfiumBackend::new()), source, config).await
}

/// Same as [`inspect`] with a caller-supplied PDF backend.
pub async fn inspect_with_backend(
    backend: Arc<dyn PdfBackend>,
    source: impl Into<SourceHandle>,
    config: &MarginConfig,
) -> Result<DocumentInfo, MarginError> {
    let source = source.into();
    let bytes = input::read_source(&source).await?;
    let size_bytes = bytes.len() as u64;
    let page_count = PageRasterizer::new(backend, config)
        .page_count_of(&source.name(), bytes)
        .await?;
    Ok(DocumentInfo {
        name: source.name(),
        display_name: source.display_name(),
        page_count,
        size_bytes,
    })
}
