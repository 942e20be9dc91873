//! Output naming and shareable URIs.
//!
//! Composed PDFs land in the cache directory as `<name>.pdf`. Other
//! applications receive a URI rather than a raw path: a provider-style
//! `content://<authority>/cache/<file>` when an authority is configured,
//! a `file://` URI otherwise.

use crate::error::MarginError;
use std::path::{Component, Path};

/// Root segment of provider URIs for files in the cache directory.
const CACHE_ROOT: &str = "cache";

/// Validate a user-entered output name and turn it into a file name.
///
/// Surrounding whitespace is trimmed and a trailing `.pdf` (any case) is not
/// doubled.
pub fn output_file_name(name: &str) -> Result<String, MarginError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(MarginError::EmptyOutputName);
    }

    let invalid = |reason: &str| MarginError::InvalidOutputName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if trimmed.contains(['/', '\\']) {
        return Err(invalid("must not contain path separators"));
    }
    if trimmed.contains('\0') {
        return Err(invalid("must not contain NUL bytes"));
    }

    let stem = match trimmed.len().checked_sub(4) {
        Some(cut) if trimmed.is_char_boundary(cut) && trimmed[cut..].eq_ignore_ascii_case(".pdf") => {
            trimmed[..cut].trim_end()
        }
        _ => trimmed,
    };
    if stem.is_empty() || stem == "." || stem == ".." {
        return Err(invalid("is not a usable file name"));
    }

    Ok(format!("{stem}.pdf"))
}

/// Build the URI handed to "open" and "share" actions for `path`.
pub fn share_uri(path: &Path, authority: Option<&str>) -> String {
    match authority {
        Some(authority) => {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!(
                "content://{}/{}/{}",
                authority,
                CACHE_ROOT,
                urlencoding::encode(&file)
            )
        }
        None => file_uri(path),
    }
}

fn file_uri(path: &Path) -> String {
    let mut uri = String::from("file://");
    for component in path.components() {
        match component {
            Component::RootDir => {}
            Component::Prefix(prefix) => {
                uri.push('/');
                uri.push_str(&prefix.as_os_str().to_string_lossy());
            }
            other => {
                uri.push('/');
                uri.push_str(&urlencoding::encode(&other.as_os_str().to_string_lossy()));
            }
        }
    }
    if uri == "file://" {
        uri.push('/');
    }
    uri
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn file_name_appends_extension() {
        assert_eq!(output_file_name("notes").unwrap(), "notes.pdf");
        assert_eq!(output_file_name("  notes  ").unwrap(), "notes.pdf");
    }

    #[test]
    fn file_name_does_not_double_extension() {
        assert_eq!(output_file_name("notes.PDF").unwrap(), "notes.pdf");
        assert_eq!(output_file_name("a.b.pdf").unwrap(), "a.b.pdf");
    }

    #[test]
    fn blank_name_is_empty_output_name() {
        assert!(matches!(output_file_name(""), Err(MarginError::EmptyOutputName)));
        assert!(matches!(output_file_name(" \t"), Err(MarginError::EmptyOutputName)));
    }

    #[test]
    fn traversal_names_are_rejected() {
        for bad in ["../x", "a/b", "a\\b", "..", ".pdf", "...pdf"] {
            let err = output_file_name(bad).unwrap_err();
            assert!(
                matches!(err, MarginError::InvalidOutputName { .. }),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn non_ascii_names_survive() {
        assert_eq!(output_file_name("회의록").unwrap(), "회의록.pdf");
    }

    #[test]
    fn provider_uri_encodes_file_name() {
        let uri = share_uri(
            &PathBuf::from("/data/cache/my notes.pdf"),
            Some("com.example.margins.provider"),
        );
        assert_eq!(
            uri,
            "content://com.example.margins.provider/cache/my%20notes.pdf"
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_uri_without_authority() {
        let uri = share_uri(&PathBuf::from("/tmp/pdf margin/out.pdf"), None);
        assert_eq!(uri, "file:///tmp/pdf%20margin/out.pdf");
    }
}
