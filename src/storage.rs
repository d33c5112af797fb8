//! Persistence of per-document artifacts.
//!
//! The orchestrator only talks to the [`Storage`] trait. [`FilesystemStorage`]
//! lays artifacts out under one directory per document:
//!
//! ```text
//! <root>/<document_id>/
//!   original.pdf
//!   pages/<N>.png
//!   chunks/page_<N>/chunk_<I>.png     (debug, optional)
//!   tables/page_<N>.json
//!   tables/global.json
//!   raw/page_<N>/chunk_<I>.txt        (debug, optional)
//!   raw/error.txt                     (diagnostic on failure)
//! ```
//!
//! Every file is written to a `.tmp` sibling and renamed into place, so a
//! reader never sees a half-written table. Tables are validated against the
//! schema before they are written and after they are read.

use crate::error::StorageError;
use crate::output::{GlobalTable, PageTable};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the pipeline keeps what it produces.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn write_original(&self, document_id: &str, pdf: &[u8]) -> Result<PathBuf, StorageError>;

    /// `png` is an already encoded page image.
    async fn write_page_image(
        &self,
        document_id: &str,
        page_number: usize,
        png: &[u8],
    ) -> Result<PathBuf, StorageError>;

    async fn write_chunk_image(
        &self,
        document_id: &str,
        page_number: usize,
        chunk_index: usize,
        png: &[u8],
    ) -> Result<PathBuf, StorageError>;

    async fn write_raw_chunk(
        &self,
        document_id: &str,
        page_number: usize,
        chunk_index: usize,
        text: &str,
    ) -> Result<PathBuf, StorageError>;

    async fn write_page_table(&self, table: &PageTable) -> Result<PathBuf, StorageError>;

    async fn write_global_table(&self, table: &GlobalTable) -> Result<PathBuf, StorageError>;

    /// Operator-facing failure record (message and trace).
    async fn write_diagnostic(&self, document_id: &str, text: &str) -> Result<PathBuf, StorageError>;

    /// `Ok(None)` until the page has been processed.
    async fn read_page_table(
        &self,
        document_id: &str,
        page_number: usize,
    ) -> Result<Option<PageTable>, StorageError>;

    /// `Ok(None)` until the document has completed.
    async fn read_global_table(&self, document_id: &str) -> Result<Option<GlobalTable>, StorageError>;

    /// Path of a stored page image, if it exists.
    async fn page_image_path(&self, document_id: &str, page_number: usize) -> Option<PathBuf>;
}

/// [`Storage`] on the local filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every artifact of one document.
    ///
    /// Ids become path components, so only `[A-Za-z0-9_-]` is accepted.
    pub fn document_dir(&self, document_id: &str) -> Result<PathBuf, StorageError> {
        let valid = !document_id.is_empty()
            && document_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidDocumentId(document_id.to_string()));
        }
        Ok(self.root.join(document_id))
    }

    fn page_table_path(&self, document_id: &str, page_number: usize) -> Result<PathBuf, StorageError> {
        Ok(self
            .document_dir(document_id)?
            .join("tables")
            .join(format!("page_{page_number}.json")))
    }

    fn global_table_path(&self, document_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.document_dir(document_id)?.join("tables").join("global.json"))
    }

    fn page_image_file(&self, document_id: &str, page_number: usize) -> Result<PathBuf, StorageError> {
        Ok(self
            .document_dir(document_id)?
            .join("pages")
            .join(format!("{page_number}.png")))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `path` via a temp file and rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err(path))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, bytes).await.map_err(io_err(path))?;
    tokio::fs::rename(&tmp_path, path).await.map_err(io_err(path))?;
    debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StorageError::Json {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn write_original(&self, document_id: &str, pdf: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.document_dir(document_id)?.join("original.pdf");
        write_atomic(&path, pdf).await?;
        Ok(path)
    }

    async fn write_page_image(
        &self,
        document_id: &str,
        page_number: usize,
        png: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let path = self.page_image_file(document_id, page_number)?;
        write_atomic(&path, png).await?;
        Ok(path)
    }

    async fn write_chunk_image(
        &self,
        document_id: &str,
        page_number: usize,
        chunk_index: usize,
        png: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let path = self
            .document_dir(document_id)?
            .join("chunks")
            .join(format!("page_{page_number}"))
            .join(format!("chunk_{chunk_index}.png"));
        write_atomic(&path, png).await?;
        Ok(path)
    }

    async fn write_raw_chunk(
        &self,
        document_id: &str,
        page_number: usize,
        chunk_index: usize,
        text: &str,
    ) -> Result<PathBuf, StorageError> {
        let path = self
            .document_dir(document_id)?
            .join("raw")
            .join(format!("page_{page_number}"))
            .join(format!("chunk_{chunk_index}.txt"));
        write_atomic(&path, text.as_bytes()).await?;
        Ok(path)
    }

    async fn write_page_table(&self, table: &PageTable) -> Result<PathBuf, StorageError> {
        table.validate()?;
        let path = self.page_table_path(&table.document_id, table.page_number)?;
        write_json(&path, table).await?;
        Ok(path)
    }

    async fn write_global_table(&self, table: &GlobalTable) -> Result<PathBuf, StorageError> {
        table.validate()?;
        let path = self.global_table_path(&table.document_id)?;
        write_json(&path, table).await?;
        Ok(path)
    }

    async fn write_diagnostic(&self, document_id: &str, text: &str) -> Result<PathBuf, StorageError> {
        let path = self.document_dir(document_id)?.join("raw").join("error.txt");
        write_atomic(&path, text.as_bytes()).await?;
        Ok(path)
    }

    async fn read_page_table(
        &self,
        document_id: &str,
        page_number: usize,
    ) -> Result<Option<PageTable>, StorageError> {
        let path = self.page_table_path(document_id, page_number)?;
        let table: Option<PageTable> = read_json(&path).await?;
        if let Some(ref t) = table {
            t.validate()?;
        }
        Ok(table)
    }

    async fn read_global_table(&self, document_id: &str) -> Result<Option<GlobalTable>, StorageError> {
        let path = self.global_table_path(document_id)?;
        let table: Option<GlobalTable> = read_json(&path).await?;
        if let Some(ref t) = table {
            t.validate()?;
        }
        Ok(table)
    }

    async fn page_image_path(&self, document_id: &str, page_number: usize) -> Option<PathBuf> {
        let path = self.page_image_file(document_id, page_number).ok()?;
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchemaError;
    use crate::output::{BoundingBox, GlobalTableBuilder, RowMetadata, Table};
    use tokio_test::assert_ok;

    fn sample_table(page: usize) -> Table {
        Table {
            header: vec!["Name".into(), "Qty".into()],
            rows: vec![vec!["Apple".into(), "3".into()], vec!["Pear".into(), "".into()]],
            row_metadata: vec![
                RowMetadata {
                    page_number: page,
                    chunk_index: 1,
                    bbox: BoundingBox { x0: 0, y0: 0, x1: 100, y1: 20 },
                    confidence: 1.0,
                },
                RowMetadata {
                    page_number: page,
                    chunk_index: 1,
                    bbox: BoundingBox { x0: 0, y0: 20, x1: 100, y1: 40 },
                    confidence: 0.5,
                },
            ],
        }
    }

    #[tokio::test]
    async fn page_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        let table = PageTable::new("doc1", 2, sample_table(2));

        let path = assert_ok!(storage.write_page_table(&table).await);
        assert!(path.ends_with("doc1/tables/page_2.json"));
        assert!(!path.with_extension("json.tmp").exists());

        let back = assert_ok!(storage.read_page_table("doc1", 2).await).unwrap();
        assert_eq!(back, table);
    }

    #[tokio::test]
    async fn missing_tables_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        assert_eq!(assert_ok!(storage.read_page_table("nope", 1).await), None);
        assert_eq!(assert_ok!(storage.read_global_table("nope").await), None);
        assert_eq!(storage.page_image_path("nope", 1).await, None);
    }

    #[tokio::test]
    async fn global_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        let mut builder = GlobalTableBuilder::new();
        builder.push_page(1, &sample_table(1));
        builder.push_page(2, &sample_table(2));
        let global = builder.finish("doc2");

        assert_ok!(storage.write_global_table(&global).await);
        let back = assert_ok!(storage.read_global_table("doc2").await).unwrap();
        assert_eq!(back.rows.len(), 4);
        assert_eq!(back.rows[2].page_number, 2);
        assert_eq!(back.rows[2].row_index_on_page, 0);
    }

    #[tokio::test]
    async fn invalid_table_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        let mut table = PageTable::new("doc3", 1, sample_table(1));
        table.rows[0].push("extra".into());

        match storage.write_page_table(&table).await {
            Err(StorageError::Schema(SchemaError::RowWidthMismatch { row: 0, .. })) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(assert_ok!(storage.read_page_table("doc3", 1).await), None);
    }

    #[tokio::test]
    async fn corrupt_table_on_disk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        let path = dir.path().join("doc4/tables/page_1.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            storage.read_page_table("doc4", 1).await,
            Err(StorageError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn artifacts_land_in_layout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());

        assert_ok!(storage.write_original("d", b"%PDF-1.7").await);
        assert_ok!(storage.write_page_image("d", 1, b"png").await);
        assert_ok!(storage.write_chunk_image("d", 1, 2, b"png").await);
        assert_ok!(storage.write_raw_chunk("d", 1, 2, "a | b").await);
        assert_ok!(storage.write_diagnostic("d", "boom").await);

        let root = dir.path().join("d");
        assert!(root.join("original.pdf").is_file());
        assert!(root.join("pages/1.png").is_file());
        assert!(root.join("chunks/page_1/chunk_2.png").is_file());
        assert_eq!(std::fs::read_to_string(root.join("raw/page_1/chunk_2.txt")).unwrap(), "a | b");
        assert_eq!(std::fs::read_to_string(root.join("raw/error.txt")).unwrap(), "boom");
        assert_eq!(storage.page_image_path("d", 1).await, Some(root.join("pages/1.png")));
    }

    #[tokio::test]
    async fn path_traversal_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        for id in ["", "..", "a/b", "../etc"] {
            assert!(matches!(
                storage.write_diagnostic(id, "x").await,
                Err(StorageError::InvalidDocumentId(_))
            ));
        }
    }
}
