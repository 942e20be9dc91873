//! Margin composition: raster pages → a new PDF with blank bands around them.
//!
//! ## Geometry
//!
//! One raster pixel is one PDF point. For a raster of `w × h` and margins
//! `(top, bottom, left, right)` the output page MediaBox is
//! `(left + w + right) × (top + h + bottom)` and the raster's top-left corner
//! sits at `(left, top)` measured from the page's top-left. PDF user space
//! grows upwards, so the image is placed with
//! `w 0 0 h left bottom cm /Im0 Do`.
//!
//! ## Pipeline
//!
//! 1. Lay out pages concurrently on the blocking pool: Flate-compress the RGB
//!    samples (plus an alpha SMask when the raster is not fully opaque) and
//!    build the page's content stream.
//! 2. Barrier: collect every layout, sort by source page index.
//! 3. Assemble the lopdf document in that order and serialise it.
//! 4. Write to a temp file inside the cache dir, then rename over `<name>.pdf`.
//!    A failure at any step leaves no partial file behind and never touches a
//!    previous result.

use crate::config::MarginConfig;
use crate::error::MarginError;
use crate::job::{EdgeInsets, OutputHandle, RasterPage};
use crate::pipeline::share;
use crate::progress::{SharedProgress, Stage};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures::stream::{self, StreamExt};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Name the page image is registered under in each page's resources.
const IMAGE_NAME: &[u8] = b"Im0";

/// One page ready to be added to the document.
struct PageLayout {
    index: usize,
    width: u32,
    height: u32,
    image: Stream,
    smask: Option<Stream>,
    content: Vec<u8>,
}

/// Builds margin-padded PDFs from page rasters and stores them in the cache dir.
pub struct MarginComposer {
    cache_dir: PathBuf,
    share_authority: Option<String>,
    concurrency: usize,
    progress: Option<SharedProgress>,
}

impl MarginComposer {
    pub fn new(config: &MarginConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            share_authority: config.share_authority.clone(),
            concurrency: config.concurrency.max(1),
            progress: config.progress_callback.clone(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Compose `pages` with `insets` and write `<output_name>.pdf`.
    ///
    /// Pages appear in the output in the order of `pages`, regardless of
    /// which layout task finishes first. An empty `pages` yields a valid PDF
    /// with zero pages.
    ///
    /// # Errors
    /// * [`MarginError::EmptyOutputName`] / [`MarginError::InvalidOutputName`]
    /// * [`MarginError::EncodeFailed`] / [`MarginError::SerializeFailed`]
    /// * [`MarginError::WriteFailure`] when the cache dir or file cannot be written
    pub async fn compose(
        &self,
        pages: Arc<Vec<RasterPage>>,
        insets: EdgeInsets,
        output_name: &str,
    ) -> Result<OutputHandle, MarginError> {
        let start = Instant::now();
        let file_name = share::output_file_name(output_name)?;
        let total = pages.len();
        info!(
            "Composing {} pages into {} (margins t{} b{} l{} r{})",
            total, file_name, insets.top, insets.bottom, insets.left, insets.right
        );
        if let Some(ref cb) = self.progress {
            cb.on_stage_start(Stage::Compose, total);
        }

        let results: Vec<Result<PageLayout, MarginError>> =
            stream::iter((0..total).map(|position| {
                let pages = Arc::clone(&pages);
                let progress = self.progress.clone();
                async move {
                    let laid_out = tokio::task::spawn_blocking(move || {
                        layout_page(position, &pages[position], insets)
                    })
                    .await
                    .map_err(|e| MarginError::Internal(format!("Layout task panicked: {}", e)))
                    .and_then(|r| r);

                    if let Some(ref cb) = progress {
                        match &laid_out {
                            Ok(_) => cb.on_page_complete(Stage::Compose, position + 1, total),
                            Err(e) => {
                                cb.on_page_error(Stage::Compose, position + 1, total, &e.to_string())
                            }
                        }
                    }
                    laid_out
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let success = results.iter().filter(|r| r.is_ok()).count();
        if let Some(ref cb) = self.progress {
            cb.on_stage_complete(Stage::Compose, total, success);
        }

        let mut layouts = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        layouts.sort_by_key(|l| l.index);

        let cache_dir = self.cache_dir.clone();
        let authority = self.share_authority.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let bytes = assemble(layouts)?;
            let path = write_atomically(&cache_dir, &file_name, &bytes)?;
            Ok::<OutputHandle, MarginError>(OutputHandle {
                uri: share::share_uri(&path, authority.as_deref()),
                path,
                page_count: total,
                size_bytes: bytes.len() as u64,
            })
        })
        .await
        .map_err(|e| MarginError::Internal(format!("Write task panicked: {}", e)))??;

        info!(
            "Wrote {} ({} bytes, {} pages) in {}ms",
            handle.path.display(),
            handle.size_bytes,
            handle.page_count,
            start.elapsed().as_millis()
        );
        Ok(handle)
    }
}

/// Encode one raster as an image XObject and build the content stream that
/// draws it at the margin offset. `position` is the page's place in the
/// output; errors report it 1-indexed.
fn layout_page(
    position: usize,
    page: &RasterPage,
    insets: EdgeInsets,
) -> Result<PageLayout, MarginError> {
    let (w, h) = (page.width(), page.height());
    let (page_w, page_h) = insets.page_size(w, h);
    let encode_err = |detail: String| MarginError::EncodeFailed {
        page: position + 1,
        detail,
    };

    let pixel_count = (w as usize) * (h as usize);
    let mut rgb = Vec::with_capacity(pixel_count * 3);
    let mut alpha = Vec::with_capacity(pixel_count);
    let mut opaque = true;
    for pixel in page.image.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel.0[3]);
        opaque &= pixel.0[3] == u8::MAX;
    }

    let image = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        },
        deflate(&rgb).map_err(|e| encode_err(e.to_string()))?,
    );

    let smask = if opaque {
        None
    } else {
        Some(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w as i64,
                "Height" => h as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            },
            deflate(&alpha).map_err(|e| encode_err(e.to_string()))?,
        ))
    };

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Integer(w as i64),
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(h as i64),
                    Object::Integer(insets.left as i64),
                    Object::Integer(insets.bottom as i64),
                ],
            ),
            Operation::new("Do", vec![Object::Name(IMAGE_NAME.to_vec())]),
            Operation::new("Q", vec![]),
        ],
    }
    .encode()
    .map_err(|e| encode_err(e.to_string()))?;

    debug!(
        "Laid out page {}: {}x{} raster on {}x{} page",
        position + 1,
        w,
        h,
        page_w,
        page_h
    );

    Ok(PageLayout {
        index: position,
        width: page_w,
        height: page_h,
        image,
        smask,
        content,
    })
}

fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Build the document from ordered layouts and serialise it.
fn assemble(layouts: Vec<PageLayout>) -> Result<Vec<u8>, MarginError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(layouts.len());

    for layout in layouts {
        let mut image = layout.image;
        if let Some(smask) = layout.smask {
            let smask_id = doc.add_object(smask);
            image.dict.set("SMask", smask_id);
        }
        let image_id = doc.add_object(image);
        let content_id = doc.add_object(Stream::new(dictionary! {}, layout.content));

        let mut xobjects = lopdf::Dictionary::new();
        xobjects.set(IMAGE_NAME.to_vec(), image_id);

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(layout.width as i64),
                Object::Integer(layout.height as i64),
            ],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => xobjects,
            },
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| MarginError::SerializeFailed(e.to_string()))?;
    Ok(bytes)
}

/// Write `bytes` to `<dir>/<file_name>` via a temp file in the same directory.
fn write_atomically(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf, MarginError> {
    let target = dir.join(file_name);
    let write_err = |source: std::io::Error| MarginError::WriteFailure {
        path: target.clone(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(write_err)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".pdfmargin-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(&target).map_err(|e| write_err(e.error))?;

    Ok(std::fs::canonicalize(&target).unwrap_or(target))
}
