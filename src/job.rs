//! The job aggregate and the value types flowing through it.
//!
//! [`Job`] is the single in-progress conversion. The wizard controller is its
//! only writer and publishes whole snapshots; everything else reads. Large
//! members (`pages`) sit behind an `Arc` so publishing a snapshot is cheap.

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One decoded page bitmap: opaque white background, RGBA.
pub type RasterImage = RgbaImage;

// ── Source handle ────────────────────────────────────────────────────────

/// Opaque reference to an input PDF.
///
/// Equality is by identity: two file handles are equal when their paths are,
/// two in-memory handles only when they share the same buffer.
#[derive(Clone)]
pub enum SourceHandle {
    /// A PDF on the local file system.
    File(PathBuf),
    /// A PDF already held in memory, e.g. handed over by a share intent.
    Memory { name: String, bytes: Arc<Vec<u8>> },
}

impl SourceHandle {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SourceHandle::File(path.into())
    }

    pub fn memory(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        SourceHandle::Memory {
            name: name.into(),
            bytes: Arc::new(bytes),
        }
    }

    /// Full name of the source, including its extension.
    pub fn name(&self) -> String {
        match self {
            SourceHandle::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            SourceHandle::Memory { name, .. } => name.clone(),
        }
    }

    /// File name without its last extension, used as the default output name.
    ///
    /// `report.final.pdf` → `report.final`. `None` when nothing is left.
    pub fn display_name(&self) -> Option<String> {
        let name = self.name();
        Path::new(&name)
            .file_stem()
            .map(|s| s.to_string_lossy().trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl PartialEq for SourceHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SourceHandle::File(a), SourceHandle::File(b)) => a == b,
            (SourceHandle::Memory { bytes: a, .. }, SourceHandle::Memory { bytes: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        }
    }
}

impl Eq for SourceHandle {}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceHandle::File(path) => f.debug_tuple("File").field(path).finish(),
            SourceHandle::Memory { name, bytes } => f
                .debug_struct("Memory")
                .field("name", name)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceHandle::File(path) => write!(f, "{}", path.display()),
            SourceHandle::Memory { name, .. } => write!(f, "memory:{name}"),
        }
    }
}

impl From<PathBuf> for SourceHandle {
    fn from(path: PathBuf) -> Self {
        SourceHandle::File(path)
    }
}

impl From<&Path> for SourceHandle {
    fn from(path: &Path) -> Self {
        SourceHandle::File(path.to_path_buf())
    }
}

impl From<&str> for SourceHandle {
    fn from(path: &str) -> Self {
        SourceHandle::File(PathBuf::from(path))
    }
}

// ── Output handle ────────────────────────────────────────────────────────

/// Shareable reference to a composed PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHandle {
    /// Where the file lives in the cache directory.
    pub path: PathBuf,
    /// URI handed to "open" and "share" actions.
    pub uri: String,
    /// Number of pages in the composed document.
    pub page_count: usize,
    /// Size of the written file in bytes.
    pub size_bytes: u64,
}

// ── Margins ──────────────────────────────────────────────────────────────

/// One edge of a page. `Left`/`Right` are the start/end edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    Top,
    Bottom,
    Left,
    Right,
}

impl Edge {
    pub const ALL: [Edge; 4] = [Edge::Top, Edge::Bottom, Edge::Left, Edge::Right];
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Edge::Top => "top",
            Edge::Bottom => "bottom",
            Edge::Left => "left",
            Edge::Right => "right",
        };
        f.write_str(s)
    }
}

/// The four user-entered margins. `None` means "not yet entered".
///
/// Values are canvas units: one raster pixel, which the composer maps to one
/// PDF point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    pub top: Option<u32>,
    pub bottom: Option<u32>,
    pub left: Option<u32>,
    pub right: Option<u32>,
}

impl Margins {
    pub fn get(&self, edge: Edge) -> Option<u32> {
        match edge {
            Edge::Top => self.top,
            Edge::Bottom => self.bottom,
            Edge::Left => self.left,
            Edge::Right => self.right,
        }
    }

    /// Copy with one edge replaced.
    pub fn with(mut self, edge: Edge, value: u32) -> Self {
        let slot = match edge {
            Edge::Top => &mut self.top,
            Edge::Bottom => &mut self.bottom,
            Edge::Left => &mut self.left,
            Edge::Right => &mut self.right,
        };
        *slot = Some(value);
        self
    }

    /// Margins to apply, with unset edges treated as 0.
    pub fn resolved(&self) -> EdgeInsets {
        EdgeInsets {
            top: self.top.unwrap_or(0),
            bottom: self.bottom.unwrap_or(0),
            left: self.left.unwrap_or(0),
            right: self.right.unwrap_or(0),
        }
    }
}

/// Concrete per-edge margins in canvas units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeInsets {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl EdgeInsets {
    pub const ZERO: EdgeInsets = EdgeInsets {
        top: 0,
        bottom: 0,
        left: 0,
        right: 0,
    };

    pub fn new(top: u32, bottom: u32, left: u32, right: u32) -> Self {
        Self {
            top,
            bottom,
            left,
            right,
        }
    }

    /// Convert millimetre margins to canvas units at the raster DPI:
    /// `round(mm / 25.4 * dpi)`.
    pub fn from_millimetres(top: f32, bottom: f32, left: f32, right: f32, dpi: u32) -> Self {
        let px = |mm: f32| -> u32 {
            let v = (mm.max(0.0) / 25.4 * dpi as f32).round();
            if v >= u32::MAX as f32 {
                u32::MAX
            } else {
                v as u32
            }
        };
        Self::new(px(top), px(bottom), px(left), px(right))
    }

    /// Output page size for a raster of `width × height`.
    pub fn page_size(&self, width: u32, height: u32) -> (u32, u32) {
        (
            self.left.saturating_add(width).saturating_add(self.right),
            self.top.saturating_add(height).saturating_add(self.bottom),
        )
    }

    /// Where the raster's top-left corner lands on the output page.
    pub fn origin(&self) -> (u32, u32) {
        (self.left, self.top)
    }

    pub fn as_margins(&self) -> Margins {
        Margins {
            top: Some(self.top),
            bottom: Some(self.bottom),
            left: Some(self.left),
            right: Some(self.right),
        }
    }
}

// ── Pages ────────────────────────────────────────────────────────────────

/// A rasterised page and its 0-based position in the source document.
#[derive(Clone)]
pub struct RasterPage {
    pub index: usize,
    pub image: RasterImage,
}

impl RasterPage {
    pub fn new(index: usize, image: RasterImage) -> Self {
        Self { index, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl fmt::Debug for RasterPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RasterPage {{ index: {}, size: {}x{} }}",
            self.index,
            self.width(),
            self.height()
        )
    }
}

// ── Job ──────────────────────────────────────────────────────────────────

/// What the job is waiting on, if anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    #[default]
    Idle,
    Rasterizing,
    Composing,
}

/// Wizard position derived from a [`Job`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Converting,
    Ready,
    Composing,
    Done,
    Failed,
}

/// The single mutable aggregate for one conversion attempt.
#[derive(Debug, Clone, Default)]
pub struct Job {
    pub source: Option<SourceHandle>,
    pub source_display_name: Option<String>,
    pub pages: Arc<Vec<RasterPage>>,
    pub margins: Margins,
    pub output_name: Option<String>,
    pub activity: Activity,
    pub is_error: bool,
    pub result: Option<OutputHandle>,
}

impl Job {
    /// True exactly while a rasterize or compose is in flight.
    pub fn is_busy(&self) -> bool {
        self.activity != Activity::Idle
    }

    /// Compose is allowed: not busy and a non-blank output name is present.
    pub fn can_compose(&self) -> bool {
        !self.is_busy()
            && self
                .output_name
                .as_deref()
                .is_some_and(|n| !n.trim().is_empty())
    }

    pub fn phase(&self) -> Phase {
        match self.activity {
            Activity::Rasterizing => Phase::Converting,
            Activity::Composing => Phase::Composing,
            Activity::Idle if self.is_error => Phase::Failed,
            Activity::Idle if self.result.is_some() => Phase::Done,
            Activity::Idle if self.source.is_some() => Phase::Ready,
            Activity::Idle => Phase::Idle,
        }
    }

    /// Serialisable view of this snapshot.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            source: self.source.as_ref().map(|s| s.to_string()),
            source_display_name: self.source_display_name.clone(),
            page_sizes: self.pages.iter().map(|p| (p.width(), p.height())).collect(),
            margins: self.margins,
            output_name: self.output_name.clone(),
            phase: self.phase(),
            is_busy: self.is_busy(),
            is_error: self.is_error,
            result: self.result.clone(),
        }
    }
}

/// Serialisable snapshot of a [`Job`], without pixel data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub source: Option<String>,
    pub source_display_name: Option<String>,
    pub page_sizes: Vec<(u32, u32)>,
    pub margins: Margins,
    pub output_name: Option<String>,
    pub phase: Phase,
    pub is_busy: bool,
    pub is_error: bool,
    pub result: Option<OutputHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_geometry_matches_margins() {
        let insets = EdgeInsets::new(10, 20, 5, 5);
        assert_eq!(insets.page_size(200, 300), (210, 330));
        assert_eq!(insets.origin(), (5, 10));
        assert_eq!(EdgeInsets::ZERO.page_size(200, 300), (200, 300));
    }

    #[test]
    fn unset_margins_resolve_to_zero() {
        let m = Margins::default().with(Edge::Left, 7);
        assert_eq!(m.resolved(), EdgeInsets::new(0, 0, 7, 0));
        assert_eq!(m.get(Edge::Top), None);
        assert_eq!(m.get(Edge::Left), Some(7));
    }

    #[test]
    fn millimetres_convert_at_dpi() {
        // 25.4 mm is one inch.
        let insets = EdgeInsets::from_millimetres(25.4, 0.0, 10.0, -3.0, 72);
        assert_eq!(insets.top, 72);
        assert_eq!(insets.bottom, 0);
        assert_eq!(insets.left, 28);
        assert_eq!(insets.right, 0);
    }

    #[test]
    fn display_name_drops_last_extension() {
        assert_eq!(
            SourceHandle::file("/docs/report.final.pdf").display_name(),
            Some("report.final".to_string())
        );
        assert_eq!(
            SourceHandle::memory("notes.pdf", vec![]).display_name(),
            Some("notes".to_string())
        );
        assert_eq!(
            SourceHandle::file("/docs/README").display_name(),
            Some("README".to_string())
        );
    }

    #[test]
    fn source_equality_is_identity() {
        let a = SourceHandle::memory("a.pdf", b"%PDF".to_vec());
        let same = a.clone();
        let twin = SourceHandle::memory("a.pdf", b"%PDF".to_vec());
        assert_eq!(a, same);
        assert_ne!(a, twin);
        assert_eq!(SourceHandle::file("/x.pdf"), SourceHandle::from("/x.pdf"));
    }

    #[test]
    fn phase_follows_flags() {
        let mut job = Job::default();
        assert_eq!(job.phase(), Phase::Idle);
        assert!(!job.can_compose());

        job.activity = Activity::Rasterizing;
        assert_eq!(job.phase(), Phase::Converting);
        assert!(job.is_busy());

        job.activity = Activity::Idle;
        job.source = Some(SourceHandle::file("/x.pdf"));
        job.output_name = Some("x".into());
        assert_eq!(job.phase(), Phase::Ready);
        assert!(job.can_compose());

        job.is_error = true;
        assert_eq!(job.phase(), Phase::Failed);
    }

    #[test]
    fn blank_name_blocks_compose() {
        let job = Job {
            output_name: Some("   ".into()),
            ..Job::default()
        };
        assert!(!job.can_compose());
    }

    #[test]
    fn summary_serialises_without_pixels() {
        let job = Job {
            pages: Arc::new(vec![RasterPage::new(0, RasterImage::new(4, 6))]),
            margins: Margins::default().with(Edge::Top, 3),
            ..Job::default()
        };
        let json = serde_json::to_string(&job.summary()).expect("serialise");
        assert!(json.contains("\"page_sizes\":[[4,6]]"), "got: {json}");
        assert!(json.contains("\"top\":3"), "got: {json}");
    }
}
