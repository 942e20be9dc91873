//! Source resolution: turn a [`SourceHandle`] into PDF bytes.
//!
//! The PDF backend loads documents from byte slices, so both file and
//! in-memory sources end up as one shared buffer. We validate the PDF magic
//! bytes (`%PDF`) before handing the buffer on, so callers get a meaningful
//! error rather than an opaque backend failure.

use crate::error::MarginError;
use crate::job::SourceHandle;
use std::sync::Arc;
use tracing::debug;

/// Read the whole source into memory.
///
/// # Errors
/// * [`MarginError::SourceUnreadable`] when the file cannot be opened or read.
/// * [`MarginError::NotAPdf`] when the bytes do not start with `%PDF`.
pub async fn read_source(source: &SourceHandle) -> Result<Arc<Vec<u8>>, MarginError> {
    let bytes = match source {
        SourceHandle::File(path) => {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| MarginError::SourceUnreadable {
                    source_name: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            Arc::new(data)
        }
        SourceHandle::Memory { bytes, .. } => Arc::clone(bytes),
    };

    check_magic(&source.name(), &bytes)?;
    debug!("Resolved source {} ({} bytes)", source, bytes.len());
    Ok(bytes)
}

/// Reject buffers that cannot be a PDF document.
pub fn check_magic(source_name: &str, bytes: &[u8]) -> Result<(), MarginError> {
    if bytes.len() < 4 {
        return Err(MarginError::SourceUnreadable {
            source_name: source_name.to_string(),
            reason: format!("only {} bytes", bytes.len()),
        });
    }
    if &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(MarginError::NotAPdf {
            source_name: source_name.to_string(),
            magic,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn missing_file_is_unreadable() {
        let source = SourceHandle::file("/definitely/not/here.pdf");
        let err = read_source(&source).await.unwrap_err();
        assert!(
            matches!(err, MarginError::SourceUnreadable { .. }),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn text_file_is_not_a_pdf() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"Hello, world").unwrap();
        let err = read_source(&SourceHandle::file(tmp.path())).await.unwrap_err();
        match err {
            MarginError::NotAPdf { magic, .. } => assert_eq!(&magic, b"Hell"),
            other => panic!("expected NotAPdf, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_source_is_read_whole() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"%PDF-1.7\n%%EOF\n").unwrap();
        let bytes = read_source(&SourceHandle::file(tmp.path())).await.unwrap();
        assert_eq!(bytes.as_slice(), b"%PDF-1.7\n%%EOF\n");
    }

    #[tokio::test]
    async fn memory_source_shares_its_buffer() {
        let source = SourceHandle::memory("m.pdf", b"%PDF-1.4".to_vec());
        let bytes = read_source(&source).await.unwrap();
        match &source {
            SourceHandle::Memory { bytes: original, .. } => {
                assert!(Arc::ptr_eq(original, &bytes))
            }
            SourceHandle::File(_) => unreachable!(),
        }
    }

    #[test]
    fn truncated_buffer_is_unreadable() {
        let err = check_magic("tiny.pdf", b"%P").unwrap_err();
        assert!(matches!(err, MarginError::SourceUnreadable { .. }));
    }
}
