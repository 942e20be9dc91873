//! PDF rasterisation: render every page of a source to an RGBA bitmap.
//!
//! ## Backend seam
//!
//! Decoding PDF pages is delegated to a [`PdfBackend`]. The production
//! backend is [`PdfiumBackend`] (pdfium via `pdfium-render`); tests plug in
//! scripted backends. A backend opens a [`DocumentSession`] over the source
//! bytes, and the session renders pages either one at a time or as a batch.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and is CPU-bound, so every
//! backend call runs on tokio's blocking pool. Sessions that render pages
//! independently fan out as separate blocking tasks (bounded by
//! `concurrency`) and are sorted back into page order once all of them have
//! finished. pdfium serialises every call behind one global lock, so a pdfium
//! session binds the library and loads the document once, then renders the
//! pages in order inside a single blocking task.
//!
//! ## Sessions
//!
//! A [`PageRasterizer`] keeps at most one open session. Each rasterisation
//! reserves a slot on entry and closes the previous session right away. A
//! session is installed only if its slot is still the latest one when the
//! backend finishes opening, so a slow open can never replace a newer
//! request. Pages of a closed session that have not started yet fail with
//! [`MarginError::SessionClosed`].

use crate::config::MarginConfig;
use crate::error::MarginError;
use crate::job::{RasterImage, RasterPage, SourceHandle};
use crate::pipeline::input;
use crate::progress::{SharedProgress, Stage};
use futures::stream::{self, StreamExt};
use pdfium_render::prelude::*;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Rendering parameters passed to every [`DocumentSession::render_page`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOptions {
    /// Dots per inch; 72 renders one pixel per PDF point.
    pub dpi: u32,
    /// Cap on either output dimension in pixels.
    pub max_pixels: u32,
}

impl RenderOptions {
    pub fn from_config(config: &MarginConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
        }
    }

    /// Scale factor from PDF points to pixels.
    pub fn scale(&self) -> f32 {
        self.dpi as f32 / 72.0
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dpi: 72,
            max_pixels: 4000,
        }
    }
}

/// Opens PDF documents for rendering. Calls may block.
pub trait PdfBackend: Send + Sync + 'static {
    /// Parse `bytes` and return a session able to render its pages.
    fn open(
        &self,
        source_name: &str,
        bytes: Arc<Vec<u8>>,
        password: Option<&str>,
    ) -> Result<Box<dyn DocumentSession>, MarginError>;
}

/// An open document. Calls may block and may run on several threads at once.
pub trait DocumentSession: Send + Sync {
    fn page_count(&self) -> usize;

    /// Render page `index` (0-based) onto an opaque white RGBA canvas.
    fn render_page(&self, index: usize, options: &RenderOptions)
        -> Result<RasterImage, MarginError>;

    /// Whether pages may be rendered from several threads at once.
    ///
    /// When `false` the rasterizer calls [`render_pages`](Self::render_pages)
    /// once from a single blocking task.
    fn renders_in_parallel(&self) -> bool {
        true
    }

    /// Render `indices` in order, handing each result to `sink`. Stops early
    /// when `sink` returns `false`.
    fn render_pages(
        &self,
        indices: &[usize],
        options: &RenderOptions,
        sink: &mut dyn FnMut(usize, Result<RasterImage, MarginError>) -> bool,
    ) {
        for &index in indices {
            if !sink(index, self.render_page(index, options)) {
                break;
            }
        }
    }

    /// Release backend resources. Called when a newer session replaces this one.
    fn close(&self) {}
}

// ── pdfium backend ───────────────────────────────────────────────────────

/// Renders with pdfium through `pdfium-render`.
///
/// The library is located via `PDFIUM_LIB_PATH` when set, then next to the
/// executable, then in the working directory, then on the system search path.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    library_path: Option<PathBuf>,
}

impl PdfiumBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit pdfium library file instead of searching for one.
    pub fn with_library_path(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, MarginError> {
        bind_pdfium(self.library_path.clone())
    }
}

/// Bind to a pdfium shared library.
pub fn bind_pdfium(explicit: Option<PathBuf>) -> Result<Pdfium, MarginError> {
    let explicit = explicit.or_else(|| {
        std::env::var_os("PDFIUM_LIB_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    });
    if let Some(path) = explicit {
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| {
            MarginError::PdfiumBindingFailed(format!("{}: {:?}", path.display(), e))
        })?;
        return Ok(Pdfium::new(bindings));
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
    {
        candidates.push(Pdfium::pdfium_platform_library_name_at_path(&dir));
    }
    candidates.push(Pdfium::pdfium_platform_library_name_at_path("./"));

    for candidate in &candidates {
        if !candidate.exists() {
            continue;
        }
        match Pdfium::bind_to_library(candidate) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(e) => warn!("Could not bind pdfium at {}: {:?}", candidate.display(), e),
        }
    }

    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| MarginError::PdfiumBindingFailed(format!("{:?}", e)))
}

fn map_load_error(source_name: &str, password: Option<&str>, e: PdfiumError) -> MarginError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            MarginError::WrongPassword {
                source_name: source_name.to_string(),
            }
        } else {
            MarginError::PasswordRequired {
                source_name: source_name.to_string(),
            }
        }
    } else {
        MarginError::CorruptPdf {
            source_name: source_name.to_string(),
            detail: err_str,
        }
    }
}

impl PdfBackend for PdfiumBackend {
    fn open(
        &self,
        source_name: &str,
        bytes: Arc<Vec<u8>>,
        password: Option<&str>,
    ) -> Result<Box<dyn DocumentSession>, MarginError> {
        let pdfium = self.bind()?;
        let page_count = {
            let document = pdfium
                .load_pdf_from_byte_slice(&bytes, password)
                .map_err(|e| map_load_error(source_name, password, e))?;
            document.pages().len() as usize
        };
        info!("PDF loaded: {} pages", page_count);

        Ok(Box::new(PdfiumSession {
            backend: self.clone(),
            source_name: source_name.to_string(),
            bytes,
            password: password.map(|p| p.to_string()),
            page_count,
        }))
    }
}

/// pdfium documents borrow their `Pdfium` instance and cannot cross threads,
/// so the session keeps the shared bytes and loads them again per render call.
struct PdfiumSession {
    backend: PdfiumBackend,
    source_name: String,
    bytes: Arc<Vec<u8>>,
    password: Option<String>,
    page_count: usize,
}

impl PdfiumSession {
    fn load<'a>(&'a self, pdfium: &'a Pdfium) -> Result<PdfDocument<'a>, MarginError> {
        let password = self.password.as_deref();
        pdfium
            .load_pdf_from_byte_slice(&self.bytes, password)
            .map_err(|e| map_load_error(&self.source_name, password, e))
    }
}

fn render_config(options: &RenderOptions) -> PdfRenderConfig {
    PdfRenderConfig::new()
        .scale_page_by_factor(options.scale())
        .set_maximum_width(options.max_pixels as i32)
        .set_maximum_height(options.max_pixels as i32)
        .set_clear_color(PdfColor::WHITE)
}

fn render_from(
    pages: &PdfPages<'_>,
    index: usize,
    config: &PdfRenderConfig,
) -> Result<RasterImage, MarginError> {
    let page = pages
        .get(index as u16)
        .map_err(|e| MarginError::RasterisationFailed {
            page: index + 1,
            detail: format!("{:?}", e),
        })?;

    let bitmap = page
        .render_with_config(config)
        .map_err(|e| MarginError::RasterisationFailed {
            page: index + 1,
            detail: format!("{:?}", e),
        })?;

    Ok(bitmap.as_image().into_rgba8())
}

impl DocumentSession for PdfiumSession {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render_page(
        &self,
        index: usize,
        options: &RenderOptions,
    ) -> Result<RasterImage, MarginError> {
        let pdfium = self.backend.bind()?;
        let document = self.load(&pdfium)?;
        render_from(document.pages(), index, &render_config(options))
    }

    fn renders_in_parallel(&self) -> bool {
        false
    }

    fn render_pages(
        &self,
        indices: &[usize],
        options: &RenderOptions,
        sink: &mut dyn FnMut(usize, Result<RasterImage, MarginError>) -> bool,
    ) {
        let Some(&first) = indices.first() else {
            return;
        };
        let pdfium = match self.backend.bind() {
            Ok(pdfium) => pdfium,
            Err(e) => {
                sink(first, Err(e));
                return;
            }
        };
        let document = match self.load(&pdfium) {
            Ok(document) => document,
            Err(e) => {
                sink(first, Err(e));
                return;
            }
        };

        let pages = document.pages();
        let config = render_config(options);
        for &index in indices {
            if !sink(index, render_from(pages, index, &config)) {
                break;
            }
        }
    }
}

// ── Rasterizer ───────────────────────────────────────────────────────────

/// A session plus the flag that marks it superseded.
struct ActiveSession {
    id: u64,
    closed: AtomicBool,
    document: Box<dyn DocumentSession>,
}

impl ActiveSession {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.document.close();
            debug!("Closed rendering session {}", self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The latest reserved session id and the session installed under it.
#[derive(Default)]
struct SessionSlot {
    latest: u64,
    session: Option<Arc<ActiveSession>>,
}

/// Turns a source PDF into an ordered list of page rasters.
pub struct PageRasterizer {
    backend: Arc<dyn PdfBackend>,
    options: RenderOptions,
    concurrency: usize,
    password: Option<String>,
    progress: Option<SharedProgress>,
    slot: Mutex<SessionSlot>,
}

impl PageRasterizer {
    pub fn new(backend: Arc<dyn PdfBackend>, config: &MarginConfig) -> Self {
        Self {
            backend,
            options: RenderOptions::from_config(config),
            concurrency: config.concurrency.max(1),
            password: config.password.clone(),
            progress: config.progress_callback.clone(),
            slot: Mutex::new(SessionSlot::default()),
        }
    }

    /// Rasterizer backed by pdfium.
    pub fn with_pdfium(config: &MarginConfig) -> Self {
        Self::new(Arc::new(PdfiumBackend::new()), config)
    }

    pub fn options(&self) -> RenderOptions {
        self.options
    }

    /// Close the open session, if any.
    ///
    /// A rasterisation still opening its document when this is called will
    /// not install its session.
    pub fn close(&self) {
        self.reserve();
    }

    /// True while a session opened by this rasterizer is still open.
    pub fn has_open_session(&self) -> bool {
        self.with_slot(|slot| slot.session.as_ref().is_some_and(|s| !s.is_closed()))
    }

    fn with_slot<T>(&self, f: impl FnOnce(&mut SessionSlot) -> T) -> T {
        match self.slot.lock() {
            Ok(mut guard) => f(&mut *guard),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    /// Take a new session id and close whatever session was installed.
    fn reserve(&self) -> u64 {
        let (id, previous) = self.with_slot(|slot| {
            slot.latest += 1;
            (slot.latest, slot.session.take())
        });
        if let Some(previous) = previous {
            previous.close();
        }
        id
    }

    /// Install `session` if no newer id was reserved since it was opened.
    fn install(&self, session: &Arc<ActiveSession>) -> bool {
        self.with_slot(|slot| {
            if slot.latest != session.id {
                return false;
            }
            slot.session = Some(Arc::clone(session));
            true
        })
    }

    /// Open the backend document for `source` without rendering anything.
    ///
    /// Returns the page count. Does not touch the active session.
    pub async fn page_count(&self, source: &SourceHandle) -> Result<usize, MarginError> {
        let bytes = input::read_source(source).await?;
        self.page_count_of(&source.name(), bytes).await
    }

    /// [`page_count`](Self::page_count) over bytes the caller already read.
    pub async fn page_count_of(
        &self,
        source_name: &str,
        bytes: Arc<Vec<u8>>,
    ) -> Result<usize, MarginError> {
        let backend = Arc::clone(&self.backend);
        let name = source_name.to_string();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || {
            let session = backend.open(&name, bytes, password.as_deref())?;
            let count = session.page_count();
            session.close();
            Ok::<usize, MarginError>(count)
        })
        .await
        .map_err(|e| MarginError::Internal(format!("Open task panicked: {}", e)))?
    }

    /// Render every page of `source`.
    ///
    /// Pages are returned in ascending page order. A document with zero pages
    /// yields an empty vector.
    ///
    /// # Errors
    /// Source errors from [`input::read_source`] and the backend's `open`;
    /// [`MarginError::SessionClosed`] when a newer rasterisation or
    /// [`close`](Self::close) supersedes this one; the first page failure
    /// otherwise.
    pub async fn rasterize(&self, source: &SourceHandle) -> Result<Vec<RasterPage>, MarginError> {
        let id = self.reserve();
        self.rasterize_reserved(id, source).await
    }

    /// [`rasterize`](Self::rasterize) as an owned future.
    ///
    /// The session slot is reserved when this is called, not when the future
    /// is first polled, so requests started in order supersede each other in
    /// that order wherever the futures end up running.
    pub fn begin_rasterize(
        self: &Arc<Self>,
        source: SourceHandle,
    ) -> impl Future<Output = Result<Vec<RasterPage>, MarginError>> + Send + 'static {
        let id = self.reserve();
        let this = Arc::clone(self);
        async move { this.rasterize_reserved(id, &source).await }
    }

    async fn rasterize_reserved(
        &self,
        id: u64,
        source: &SourceHandle,
    ) -> Result<Vec<RasterPage>, MarginError> {
        let start = Instant::now();
        let bytes = input::read_source(source).await?;

        let backend = Arc::clone(&self.backend);
        let name = source.name();
        let password = self.password.clone();
        let document = tokio::task::spawn_blocking(move || {
            backend.open(&name, bytes, password.as_deref())
        })
        .await
        .map_err(|e| MarginError::Internal(format!("Open task panicked: {}", e)))??;

        let session = Arc::new(ActiveSession {
            id,
            closed: AtomicBool::new(false),
            document,
        });
        if !self.install(&session) {
            debug!("Session {} superseded while opening {}", id, source);
            session.close();
            return Err(MarginError::SessionClosed { page: 1 });
        }

        let total = session.document.page_count();
        info!("Rasterising {} pages of {} (session {})", total, source, id);
        if let Some(ref cb) = self.progress {
            cb.on_stage_start(Stage::Rasterize, total);
        }
        if total == 0 {
            if let Some(ref cb) = self.progress {
                cb.on_stage_complete(Stage::Rasterize, 0, 0);
            }
            return Ok(Vec::new());
        }

        let results = if session.document.renders_in_parallel() {
            self.render_concurrently(&session, total).await
        } else {
            self.render_in_one_pass(&session, total).await?
        };

        let success = results.iter().filter(|r| r.is_ok()).count();
        if let Some(ref cb) = self.progress {
            cb.on_stage_complete(Stage::Rasterize, total, success);
        }

        let mut pages = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        pages.sort_by_key(|p| p.index);

        info!(
            "Rendered {} pages in {}ms",
            pages.len(),
            start.elapsed().as_millis()
        );
        Ok(pages)
    }

    async fn render_concurrently(
        &self,
        session: &Arc<ActiveSession>,
        total: usize,
    ) -> Vec<Result<RasterPage, MarginError>> {
        let options = self.options;
        stream::iter((0..total).map(|index| {
            let session = Arc::clone(session);
            let progress = self.progress.clone();
            async move {
                let rendered = tokio::task::spawn_blocking(move || {
                    if session.is_closed() {
                        return Err(MarginError::SessionClosed { page: index + 1 });
                    }
                    session.document.render_page(index, &options)
                })
                .await
                .map_err(|e| MarginError::Internal(format!("Render task panicked: {}", e)))
                .and_then(|r| r);

                report_page(progress.as_ref(), index, total, &rendered);
                rendered.map(|image| RasterPage::new(index, image))
            }
        }))
        .buffer_unordered(self.concurrency)
        .collect()
        .await
    }

    /// Render all pages inside one blocking task, checking between pages
    /// whether the session was closed.
    async fn render_in_one_pass(
        &self,
        session: &Arc<ActiveSession>,
        total: usize,
    ) -> Result<Vec<Result<RasterPage, MarginError>>, MarginError> {
        let options = self.options;
        let session = Arc::clone(session);
        let progress = self.progress.clone();
        tokio::task::spawn_blocking(move || {
            if session.is_closed() {
                return vec![Err(MarginError::SessionClosed { page: 1 })];
            }
            let indices: Vec<usize> = (0..total).collect();
            let mut results = Vec::with_capacity(total);
            session
                .document
                .render_pages(&indices, &options, &mut |index, rendered| {
                    report_page(progress.as_ref(), index, total, &rendered);
                    let keep_going = rendered.is_ok();
                    results.push(rendered.map(|image| RasterPage::new(index, image)));
                    if keep_going && index + 1 < total && session.is_closed() {
                        results.push(Err(MarginError::SessionClosed { page: index + 2 }));
                        return false;
                    }
                    keep_going
                });
            results
        })
        .await
        .map_err(|e| MarginError::Internal(format!("Render task panicked: {}", e)))
    }
}

fn report_page(
    progress: Option<&SharedProgress>,
    index: usize,
    total: usize,
    rendered: &Result<RasterImage, MarginError>,
) {
    match rendered {
        Ok(image) => {
            debug!(
                "Rendered page {} → {}x{} px",
                index + 1,
                image.width(),
                image.height()
            );
            if let Some(cb) = progress {
                cb.on_page_complete(Stage::Rasterize, index + 1, total);
            }
        }
        Err(e) => {
            if let Some(cb) = progress {
                cb.on_page_error(Stage::Rasterize, index + 1, total, &e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Pages render slower the earlier they are, so completion order is the
    /// reverse of page order.
    struct ScriptedBackend {
        sizes: Vec<(u32, u32)>,
        fail_page: Option<usize>,
        /// Source name whose `open` takes 80 ms.
        slow_source: Option<&'static str>,
        /// Sessions render through `render_pages` from one thread.
        sequential: bool,
        opens: AtomicUsize,
        batches: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedBackend {
        fn new(sizes: Vec<(u32, u32)>) -> Self {
            Self {
                sizes,
                fail_page: None,
                slow_source: None,
                sequential: false,
                opens: AtomicUsize::new(0),
                batches: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct ScriptedSession {
        sizes: Vec<(u32, u32)>,
        fail_page: Option<usize>,
        sequential: bool,
        batches: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl PdfBackend for ScriptedBackend {
        fn open(
            &self,
            source_name: &str,
            _bytes: Arc<Vec<u8>>,
            _password: Option<&str>,
        ) -> Result<Box<dyn DocumentSession>, MarginError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.slow_source == Some(source_name) {
                std::thread::sleep(Duration::from_millis(80));
            }
            Ok(Box::new(ScriptedSession {
                sizes: self.sizes.clone(),
                fail_page: self.fail_page,
                sequential: self.sequential,
                batches: Arc::clone(&self.batches),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    impl DocumentSession for ScriptedSession {
        fn page_count(&self) -> usize {
            self.sizes.len()
        }

        fn render_page(
            &self,
            index: usize,
            _options: &RenderOptions,
        ) -> Result<RasterImage, MarginError> {
            let delay = (self.sizes.len() - index) as u64 * 15;
            std::thread::sleep(Duration::from_millis(delay));
            if self.fail_page == Some(index) {
                return Err(MarginError::RasterisationFailed {
                    page: index + 1,
                    detail: "scripted failure".into(),
                });
            }
            let (w, h) = self.sizes[index];
            Ok(RasterImage::from_pixel(w, h, Rgba([255, 255, 255, 255])))
        }

        fn renders_in_parallel(&self) -> bool {
            !self.sequential
        }

        fn render_pages(
            &self,
            indices: &[usize],
            options: &RenderOptions,
            sink: &mut dyn FnMut(usize, Result<RasterImage, MarginError>) -> bool,
        ) {
            self.batches.fetch_add(1, Ordering::SeqCst);
            for &index in indices {
                if !sink(index, self.render_page(index, options)) {
                    break;
                }
            }
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Counts per-page progress events.
    #[derive(Default)]
    struct PageCounter {
        done: AtomicUsize,
        failed: AtomicUsize,
    }

    impl crate::progress::ProgressCallback for PageCounter {
        fn on_page_complete(&self, _stage: Stage, _page: usize, _total: usize) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _stage: Stage, _page: usize, _total: usize, _error: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn source() -> SourceHandle {
        SourceHandle::memory("doc.pdf", b"%PDF-1.7 scripted".to_vec())
    }

    fn config() -> MarginConfig {
        MarginConfig::builder().concurrency(8).build().unwrap()
    }

    #[tokio::test]
    async fn pages_come_back_in_page_order() {
        let sizes = vec![(10, 11), (20, 21), (30, 31), (40, 41), (50, 51)];
        let rasterizer = PageRasterizer::new(Arc::new(ScriptedBackend::new(sizes.clone())), &config());

        let pages = rasterizer.rasterize(&source()).await.expect("rasterize");

        assert_eq!(pages.len(), 5);
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.index, i);
            assert_eq!((page.width(), page.height()), sizes[i]);
        }
    }

    #[tokio::test]
    async fn zero_page_document_is_empty() {
        let rasterizer = PageRasterizer::new(Arc::new(ScriptedBackend::new(vec![])), &config());
        let pages = rasterizer.rasterize(&source()).await.expect("rasterize");
        assert!(pages.is_empty());
    }

    #[tokio::test]
    async fn page_failure_fails_the_whole_rasterisation() {
        let mut backend = ScriptedBackend::new(vec![(5, 5), (5, 5), (5, 5)]);
        backend.fail_page = Some(1);
        let rasterizer = PageRasterizer::new(Arc::new(backend), &config());

        let err = rasterizer.rasterize(&source()).await.unwrap_err();
        assert!(
            matches!(err, MarginError::RasterisationFailed { page: 2, .. }),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn new_rasterisation_closes_previous_session() {
        let backend = Arc::new(ScriptedBackend::new(vec![(5, 5)]));
        let closes = Arc::clone(&backend.closes);
        let rasterizer = PageRasterizer::new(backend.clone(), &config());

        rasterizer.rasterize(&source()).await.unwrap();
        assert!(rasterizer.has_open_session());
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        rasterizer.rasterize(&source()).await.unwrap();
        assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        rasterizer.close();
        assert!(!rasterizer.has_open_session());
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreadable_source_never_reaches_backend() {
        let backend = Arc::new(ScriptedBackend::new(vec![(5, 5)]));
        let rasterizer = PageRasterizer::new(backend.clone(), &config());

        let err = rasterizer
            .rasterize(&SourceHandle::file("/no/such/file.pdf"))
            .await
            .unwrap_err();
        assert!(err.is_source_error());
        assert_eq!(backend.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn page_count_does_not_replace_active_session() {
        let backend = Arc::new(ScriptedBackend::new(vec![(5, 5), (6, 6)]));
        let closes = Arc::clone(&backend.closes);
        let rasterizer = PageRasterizer::new(backend, &config());

        assert_eq!(rasterizer.page_count(&source()).await.unwrap(), 2);
        assert!(!rasterizer.has_open_session());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_open_does_not_replace_newer_session() {
        let mut backend = ScriptedBackend::new(vec![(5, 5); 6]);
        backend.slow_source = Some("slow.pdf");
        let rasterizer = Arc::new(PageRasterizer::new(Arc::new(backend), &config()));

        let stale = {
            let rasterizer = Arc::clone(&rasterizer);
            tokio::spawn(async move {
                let slow = SourceHandle::memory("slow.pdf", b"%PDF-1.7 slow".to_vec());
                rasterizer.rasterize(&slow).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = rasterizer.rasterize(&source()).await.expect("newer request wins");
        assert_eq!(fresh.len(), 6);

        let err = stale.await.unwrap().unwrap_err();
        assert!(matches!(err, MarginError::SessionClosed { .. }), "got: {err:?}");
        assert!(rasterizer.has_open_session());
    }

    #[tokio::test]
    async fn begun_requests_supersede_in_call_order() {
        let rasterizer = Arc::new(PageRasterizer::new(
            Arc::new(ScriptedBackend::new(vec![(5, 5)])),
            &config(),
        ));

        let older = rasterizer.begin_rasterize(source());
        let newer = rasterizer.begin_rasterize(source());
        // Poll the newer one first; the older still loses.
        let pages = newer.await.expect("newer request");
        assert_eq!(pages.len(), 1);
        let err = older.await.unwrap_err();
        assert!(matches!(err, MarginError::SessionClosed { page: 1 }), "got: {err:?}");
        assert!(rasterizer.has_open_session());
    }

    #[tokio::test]
    async fn close_while_opening_discards_late_session() {
        let mut backend = ScriptedBackend::new(vec![(5, 5)]);
        backend.slow_source = Some("slow.pdf");
        let backend = Arc::new(backend);
        let closes = Arc::clone(&backend.closes);
        let rasterizer = Arc::new(PageRasterizer::new(backend, &config()));

        let pending = {
            let rasterizer = Arc::clone(&rasterizer);
            tokio::spawn(async move {
                let slow = SourceHandle::memory("slow.pdf", b"%PDF-1.7 slow".to_vec());
                rasterizer.rasterize(&slow).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        rasterizer.close();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, MarginError::SessionClosed { page: 1 }), "got: {err:?}");
        assert!(!rasterizer.has_open_session());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_session_renders_in_one_pass() {
        let sizes = vec![(10, 11), (20, 21), (30, 31), (40, 41)];
        let mut backend = ScriptedBackend::new(sizes.clone());
        backend.sequential = true;
        let backend = Arc::new(backend);
        let batches = Arc::clone(&backend.batches);
        let counter = Arc::new(PageCounter::default());
        let config = MarginConfig::builder()
            .concurrency(8)
            .progress_callback(counter.clone())
            .build()
            .unwrap();
        let rasterizer = PageRasterizer::new(backend, &config);

        let pages = rasterizer.rasterize(&source()).await.expect("rasterize");

        assert_eq!(batches.load(Ordering::SeqCst), 1);
        let got: Vec<_> = pages.iter().map(|p| (p.index, (p.width(), p.height()))).collect();
        let want: Vec<_> = sizes.into_iter().enumerate().collect();
        assert_eq!(got, want);
        assert_eq!(counter.done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn sequential_session_stops_at_first_failure() {
        let mut backend = ScriptedBackend::new(vec![(5, 5); 4]);
        backend.sequential = true;
        backend.fail_page = Some(1);
        let counter = Arc::new(PageCounter::default());
        let config = MarginConfig::builder()
            .progress_callback(counter.clone())
            .build()
            .unwrap();
        let rasterizer = PageRasterizer::new(Arc::new(backend), &config);

        let err = rasterizer.rasterize(&source()).await.unwrap_err();
        assert!(
            matches!(err, MarginError::RasterisationFailed { page: 2, .. }),
            "got: {err:?}"
        );
        assert_eq!(counter.done.load(Ordering::SeqCst), 1);
        assert_eq!(counter.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closing_mid_pass_stops_remaining_pages() {
        // Four pages at 60, 45, 30, 15 ms.
        let mut backend = ScriptedBackend::new(vec![(5, 5); 4]);
        backend.sequential = true;
        let rasterizer = Arc::new(PageRasterizer::new(Arc::new(backend), &config()));

        let running = {
            let rasterizer = Arc::clone(&rasterizer);
            tokio::spawn(async move { rasterizer.rasterize(&source()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        rasterizer.close();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, MarginError::SessionClosed { page: 2 }), "got: {err:?}");
    }

    #[test]
    fn render_scale_follows_dpi() {
        let opts = RenderOptions {
            dpi: 144,
            max_pixels: 1000,
        };
        assert!((opts.scale() - 2.0).abs() < f32::EPSILON);
        assert!((RenderOptions::default().scale() - 1.0).abs() < f32::EPSILON);
    }
}
