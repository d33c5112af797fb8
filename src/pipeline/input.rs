//! Input validation: read a local PDF and check it really is one.
//!
//! Bytes are checked for the `%PDF` magic before anything else touches them
//! so callers get a meaningful rejection instead of a pdfium parse error.

use crate::error::Pdf2TableError;
use std::path::Path;
use tracing::debug;

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Verify that `bytes` start with the PDF magic.
pub fn check_pdf_magic(bytes: &[u8]) -> Result<(), Pdf2TableError> {
    if bytes.len() < PDF_MAGIC.len() || &bytes[..PDF_MAGIC.len()] != PDF_MAGIC {
        return Err(Pdf2TableError::NotAPdf {
            magic: bytes.iter().take(PDF_MAGIC.len()).copied().collect(),
        });
    }
    Ok(())
}

/// Read a local PDF file, mapping I/O failures to input errors.
pub async fn read_pdf(path: impl AsRef<Path>) -> Result<Vec<u8>, Pdf2TableError> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => Pdf2TableError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => Pdf2TableError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;
    check_pdf_magic(&bytes)?;
    debug!("Read {} bytes from {}", bytes.len(), path.display());
    Ok(bytes)
}
