//! Configuration types for rasterising and composing.
//!
//! Every knob lives in [`MarginConfig`], built via [`MarginConfigBuilder`].
//! The same config drives [`crate::pipeline::render::PageRasterizer`],
//! [`crate::pipeline::compose::MarginComposer`] and the wizard controller.

use crate::error::MarginError;
use crate::progress::SharedProgress;
use std::fmt;
use std::path::PathBuf;

/// Configuration for one pdfmargin session.
///
/// # Example
/// ```rust
/// use pdfmargin::MarginConfig;
///
/// let config = MarginConfig::builder()
///     .dpi(144)
///     .concurrency(8)
///     .min_busy_ms(0)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 144);
/// ```
#[derive(Clone)]
pub struct MarginConfig {
    /// Rendering DPI used when rasterising each page. Range: 36–400. Default: 72.
    ///
    /// At 72 DPI one raster pixel is one PDF point, so the composed page keeps
    /// the physical size of the source page plus the margins.
    pub dpi: u32,

    /// Cap on either raster dimension in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// Upper bound on per-page tasks in flight, for both stages. Default: 4.
    pub concurrency: usize,

    /// Minimum time a compose keeps the job busy, in milliseconds. Default: 1000.
    ///
    /// Fast composes still show progress feedback for this long.
    pub min_busy_ms: u64,

    /// Directory composed PDFs are written to.
    pub cache_dir: PathBuf,

    /// Provider authority used to build `content://` share URIs.
    /// When `None`, output handles carry `file://` URIs.
    pub share_authority: Option<String>,

    /// PDF user password for encrypted sources.
    pub password: Option<String>,

    /// Per-page progress events.
    pub progress_callback: Option<SharedProgress>,
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            dpi: 72,
            max_rendered_pixels: 4000,
            concurrency: 4,
            min_busy_ms: 1000,
            cache_dir: default_cache_dir(),
            share_authority: None,
            password: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for MarginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarginConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("min_busy_ms", &self.min_busy_ms)
            .field("cache_dir", &self.cache_dir)
            .field("share_authority", &self.share_authority)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ProgressCallback>"),
            )
            .finish()
    }
}

impl MarginConfig {
    /// Create a new builder for `MarginConfig`.
    pub fn builder() -> MarginConfigBuilder {
        MarginConfigBuilder {
            config: Self::default(),
        }
    }
}

/// `<platform cache dir>/pdfmargin`, or `<tmp>/pdfmargin` when the platform
/// has no cache dir.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pdfmargin")
}

/// Builder for [`MarginConfig`].
#[derive(Debug)]
pub struct MarginConfigBuilder {
    config: MarginConfig,
}

impl MarginConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(36, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn min_busy_ms(mut self, ms: u64) -> Self {
        self.config.min_busy_ms = ms;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn share_authority(mut self, authority: impl Into<String>) -> Self {
        self.config.share_authority = Some(authority.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn progress_callback(mut self, cb: SharedProgress) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<MarginConfig, MarginError> {
        let c = &self.config;
        if c.dpi < 36 || c.dpi > 400 {
            return Err(MarginError::InvalidConfig(format!(
                "DPI must be 36–400, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(MarginError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.cache_dir.as_os_str().is_empty() {
            return Err(MarginError::InvalidConfig(
                "Cache directory must not be empty".into(),
            ));
        }
        if let Some(ref authority) = c.share_authority {
            if authority.trim().is_empty() || authority.contains('/') {
                return Err(MarginError::InvalidConfig(format!(
                    "Share authority '{authority}' must be a non-empty host name"
                )));
            }
        }
        Ok(self.config)
    }
}
