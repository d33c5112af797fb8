//! Table types produced by the pipeline and their persisted JSON shapes.
//!
//! [`Table`] is the in-memory per-page result of the merger. [`PageTable`]
//! and [`GlobalTable`] are the wire shapes written to storage; downstream
//! consumers depend on their field names, so both are validated on every
//! write and read (see [`PageTable::validate`] and [`GlobalTable::validate`]).

use crate::error::SchemaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pixel rectangle in page-image space.
///
/// For rows this is an approximation: the chunk's vertical span is divided
/// evenly between its rows, and `x` always covers the full page width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl BoundingBox {
    fn check(&self, row: usize) -> Result<(), SchemaError> {
        if self.x0 > self.x1 || self.y0 > self.y1 {
            return Err(SchemaError::InvertedBoundingBox {
                row,
                detail: format!(
                    "({}, {}) -> ({}, {})",
                    self.x0, self.y0, self.x1, self.y1
                ),
            });
        }
        Ok(())
    }
}

/// Where a row came from and how complete it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMetadata {
    pub page_number: usize,
    pub chunk_index: usize,
    pub bbox: BoundingBox,
    /// Completeness heuristic in `[0, 1]`, not a model-reported probability.
    pub confidence: f64,
}

/// A merged table: one header, rows normalised to the header width.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_metadata: Vec<RowMetadata>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Persisted per-page table (`tables/page_N.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageTable {
    pub document_id: String,
    pub page_number: usize,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_metadata: Vec<RowMetadata>,
    pub generated_at: DateTime<Utc>,
}

impl PageTable {
    pub fn new(document_id: impl Into<String>, page_number: usize, table: Table) -> Self {
        Self {
            document_id: document_id.into(),
            page_number,
            header: table.header,
            rows: table.rows,
            row_metadata: table.row_metadata,
            generated_at: Utc::now(),
        }
    }

    /// Check the table against the page-table contract.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.document_id.is_empty() {
            return Err(SchemaError::EmptyDocumentId);
        }
        if self.page_number == 0 {
            return Err(SchemaError::InvalidPageNumber(0));
        }
        if self.rows.len() != self.row_metadata.len() {
            return Err(SchemaError::MetadataLengthMismatch {
                rows: self.rows.len(),
                metadata: self.row_metadata.len(),
            });
        }
        for (i, (row, meta)) in self.rows.iter().zip(&self.row_metadata).enumerate() {
            if row.len() != self.header.len() {
                return Err(SchemaError::RowWidthMismatch {
                    row: i,
                    width: row.len(),
                    header: self.header.len(),
                });
            }
            if meta.page_number != self.page_number {
                return Err(SchemaError::PageMismatch {
                    row: i,
                    expected: self.page_number,
                    found: meta.page_number,
                });
            }
            if meta.chunk_index == 0 {
                return Err(SchemaError::InvalidChunkIndex { row: i });
            }
            check_confidence(i, meta.confidence)?;
            meta.bbox.check(i)?;
        }
        Ok(())
    }
}

/// One row of the document-wide table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTableRow {
    pub page_number: usize,
    /// Zero-based position of the row within its page table.
    pub row_index_on_page: usize,
    pub values: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

/// Persisted document-wide table (`tables/global.json`).
///
/// The header is the first non-empty page header. Rows keep the width of
/// their own page table, so pages with a different column layout are not
/// forced into the first page's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTable {
    pub document_id: String,
    pub header: Vec<String>,
    pub rows: Vec<GlobalTableRow>,
    pub generated_at: DateTime<Utc>,
}

impl GlobalTable {
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.document_id.is_empty() {
            return Err(SchemaError::EmptyDocumentId);
        }
        for (i, row) in self.rows.iter().enumerate() {
            if row.page_number == 0 {
                return Err(SchemaError::InvalidPageNumber(0));
            }
            check_confidence(i, row.confidence)?;
            if let Some(bbox) = &row.bbox {
                bbox.check(i)?;
            }
        }
        Ok(())
    }

    /// Rows belonging to one page, in page order.
    pub fn rows_for_page(&self, page_number: usize) -> impl Iterator<Item = &GlobalTableRow> {
        self.rows
            .iter()
            .filter(move |r| r.page_number == page_number)
    }
}

fn check_confidence(row: usize, confidence: f64) -> Result<(), SchemaError> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(SchemaError::ConfidenceOutOfRange { row, confidence });
    }
    Ok(())
}

/// Accumulates page tables into the global table, in page order.
#[derive(Debug, Default)]
pub struct GlobalTableBuilder {
    header: Option<Vec<String>>,
    rows: Vec<GlobalTableRow>,
}

impl GlobalTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every row of `table`, re-indexed from zero for this page.
    pub fn push_page(&mut self, page_number: usize, table: &Table) {
        if self.header.is_none() && !table.header.is_empty() {
            self.header = Some(table.header.clone());
        }
        for (idx, (row, meta)) in table.rows.iter().zip(&table.row_metadata).enumerate() {
            self.rows.push(GlobalTableRow {
                page_number,
                row_index_on_page: idx,
                values: row.clone(),
                confidence: meta.confidence,
                bbox: Some(meta.bbox),
            });
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn finish(self, document_id: impl Into<String>) -> GlobalTable {
        GlobalTable {
            document_id: document_id.into(),
            header: self.header.unwrap_or_default(),
            rows: self.rows,
            generated_at: Utc::now(),
        }
    }
}
