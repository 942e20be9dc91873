//! Pipeline stages for adding margins to a PDF.
//!
//! Each submodule implements exactly one transformation step and is tested
//! on its own. The [`crate::controller`] sequences them for the interactive
//! flow; [`crate::convert`] chains them for one-shot use.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ compose ──▶ share
//! (bytes)   (pdfium)   (lopdf)     (name + URI)
//! ```
//!
//! 1. [`input`]   : resolve a file or in-memory source to bytes, check `%PDF`
//! 2. [`render`]  : rasterise every page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`compose`] : draw each raster inset on a larger page and write the
//!    document to the cache dir
//! 4. [`share`]   : output file naming and the URI handed to other apps

pub mod compose;
pub mod input;
pub mod render;
pub mod share;
