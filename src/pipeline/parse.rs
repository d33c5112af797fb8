//! Row parsing and per-page merging of chunk responses.
//!
//! The model answers each chunk with delimiter-separated text. This module
//! turns that text into rows ([`parse_rows`]) and folds the rows of every
//! chunk of a page, in chunk order, into a single [`Table`] ([`PageMerger`]).
//!
//! ## Merge rules
//!
//! 1. The first row of the first chunk that yields any rows is the page
//!    header.
//! 2. A later chunk whose first row equals the header (cell-wise, trimmed)
//!    repeats it; that row is dropped. Otherwise it is data.
//! 3. Data rows are padded or truncated to the header width.
//! 4. Exact consecutive duplicates within a chunk are dropped, then the
//!    chunk's first surviving row is dropped if it equals the last row
//!    already on the page. This removes rows captured twice by the overlap
//!    between two chunks.
//!
//! ## Row geometry
//!
//! The model does not report where a row sits. Each chunk's vertical span
//! is divided evenly between the rows it contributed, so a row's bounding
//! box is an interpolation, not a measured position.

use crate::output::{BoundingBox, RowMetadata, Table};
use crate::pipeline::chunk::ChunkSpan;
use once_cell::sync::Lazy;
use regex::Regex;

/// Lines containing this marker are horizontal rules, not rows.
pub const RULE_MARKER: &str = "-----";

// Markdown alignment rows: `|---|:---:|`, `--- | ---`.
static RE_SEPARATOR_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|?\s*:?-{3,}:?\s*(\|\s*:?-{3,}:?\s*)*\|?$").unwrap());

fn is_rule_line(line: &str) -> bool {
    line.contains(RULE_MARKER) || RE_SEPARATOR_ROW.is_match(line)
}

/// Parse raw model text into rows of trimmed cells.
///
/// Blank lines and rule lines are skipped. A line framed by the delimiter
/// (`| a | b |`) loses the empty first and last field it produces; a line
/// with no fields left is skipped.
pub fn parse_rows(text: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || is_rule_line(line) {
            continue;
        }

        let mut cells: Vec<&str> = line.split(delimiter).map(str::trim).collect();
        if cells.first() == Some(&"") {
            cells.remove(0);
        }
        if cells.last() == Some(&"") {
            cells.pop();
        }
        if cells.is_empty() {
            continue;
        }
        rows.push(cells.into_iter().map(String::from).collect());
    }
    rows
}

/// Pad with empty cells or truncate so `row` has exactly `width` cells.
pub fn normalize_width(mut row: Vec<String>, width: usize) -> Vec<String> {
    row.resize(width, String::new());
    row
}

/// Cell-wise equality after trimming.
pub fn rows_equal(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.trim() == y.trim())
}

/// Drop rows identical (after trim) to the row immediately before them.
pub fn dedupe_consecutive(rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = Vec::with_capacity(rows.len());
    for row in rows {
        if out.last().is_some_and(|prev| rows_equal(prev, &row)) {
            continue;
        }
        out.push(row);
    }
    out
}

/// Completeness heuristic: non-empty cells over column count, in `[0, 1]`.
pub fn row_confidence(row: &[String]) -> f64 {
    if row.is_empty() {
        return 0.0;
    }
    let filled = row.iter().filter(|c| !c.trim().is_empty()).count();
    (filled as f64 / row.len().max(1) as f64).clamp(0.0, 1.0)
}

/// Bounding box of row `idx` out of `n` rows sharing the span `[top, bottom]`.
///
/// Slice height is at least one pixel; boxes past the chunk bottom collapse
/// onto it.
pub fn row_bbox(page_width: u32, top: u32, bottom: u32, idx: usize, n: usize) -> BoundingBox {
    let n = n.max(1);
    let h = ((bottom.saturating_sub(top)) as f64 / n as f64).max(1.0);
    let y0 = (top as f64 + idx as f64 * h).min(bottom as f64).round();
    let y1 = (bottom as f64).min(top as f64 + (idx as f64 + 1.0) * h).round();
    BoundingBox {
        x0: 0,
        y0: y0 as u32,
        x1: page_width,
        y1: y1 as u32,
    }
}

/// Folds chunk responses of one page, in chunk order, into a [`Table`].
#[derive(Debug)]
pub struct PageMerger {
    page_number: usize,
    page_width: u32,
    delimiter: char,
    header: Option<Vec<String>>,
    table: Table,
}

impl PageMerger {
    pub fn new(page_number: usize, page_width: u32, delimiter: char) -> Self {
        Self {
            page_number,
            page_width,
            delimiter,
            header: None,
            table: Table::default(),
        }
    }

    /// Merge the raw response for one chunk. Must be called in chunk order.
    ///
    /// Returns the number of rows the chunk contributed to the page.
    pub fn push_chunk(&mut self, span: ChunkSpan, text: &str) -> usize {
        let mut parsed = parse_rows(text, self.delimiter).into_iter();

        let data: Vec<Vec<String>> = match &self.header {
            None => match parsed.next() {
                Some(first) => {
                    self.header = Some(first);
                    parsed.collect()
                }
                None => return 0,
            },
            Some(header) => {
                let rows: Vec<Vec<String>> = parsed.collect();
                match rows.first() {
                    Some(first) if rows_equal(first, header) => rows.into_iter().skip(1).collect(),
                    _ => rows,
                }
            }
        };

        let width = self.header.as_ref().map_or(0, Vec::len);
        let normalized: Vec<Vec<String>> = data
            .into_iter()
            .map(|r| normalize_width(r, width))
            .collect();

        let mut kept = dedupe_consecutive(normalized);
        if let (Some(first), Some(last)) = (kept.first(), self.table.rows.last()) {
            if rows_equal(first, last) {
                kept.remove(0);
            }
        }

        let n = kept.len();
        for (i, row) in kept.into_iter().enumerate() {
            let meta = RowMetadata {
                page_number: self.page_number,
                chunk_index: span.chunk_index,
                bbox: row_bbox(self.page_width, span.top, span.bottom, i, n),
                confidence: row_confidence(&row),
            };
            self.table.rows.push(row);
            self.table.row_metadata.push(meta);
        }
        n
    }

    pub fn finish(mut self) -> Table {
        self.table.header = self.header.unwrap_or_default();
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    fn span(idx: usize, top: u32, bottom: u32) -> ChunkSpan {
        ChunkSpan {
            chunk_index: idx,
            top,
            bottom,
        }
    }

    #[test]
    fn parse_drops_rules_and_outer_pipes() {
        let rows = parse_rows("--- -----\n A | B \n 1 | 2 \n", '|');
        assert_eq!(rows, vec![row(&["A", "B"]), row(&["1", "2"])]);
    }

    #[test]
    fn parse_framed_lines() {
        let rows = parse_rows("| a | b |\n|  c |  |\n", '|');
        assert_eq!(rows, vec![row(&["a", "b"]), row(&["c", ""])]);
    }

    #[test]
    fn parse_skips_blank_and_empty_lines() {
        let rows = parse_rows("\n   \n|\n x \n", '|');
        assert_eq!(rows, vec![row(&["x"])]);
    }

    #[test]
    fn parse_skips_markdown_separator_rows() {
        let rows = parse_rows("| A | B |\n|---|:---:|\n| 1 | 2 |", '|');
        assert_eq!(rows, vec![row(&["A", "B"]), row(&["1", "2"])]);
    }

    #[test]
    fn parse_keeps_inner_empty_cells() {
        let rows = parse_rows("a||c", '|');
        assert_eq!(rows, vec![row(&["a", "", "c"])]);
    }

    #[test]
    fn parse_custom_delimiter() {
        let rows = parse_rows("a ; b\n", ';');
        assert_eq!(rows, vec![row(&["a", "b"])]);
    }

    #[test]
    fn normalize_pads_and_truncates() {
        assert_eq!(normalize_width(row(&["a", "b"]), 3), row(&["a", "b", ""]));
        assert_eq!(normalize_width(row(&["a", "b", "c", "d"]), 3), row(&["a", "b", "c"]));
    }

    #[test]
    fn confidence_is_completeness() {
        assert!((row_confidence(&row(&["a", "", "c"])) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(row_confidence(&[]), 0.0);
        assert_eq!(row_confidence(&row(&[" ", ""])), 0.0);
        assert_eq!(row_confidence(&row(&["x"])), 1.0);
    }

    #[test]
    fn dedupe_only_consecutive() {
        let rows = vec![row(&["a"]), row(&[" a "]), row(&["b"]), row(&["a"])];
        assert_eq!(dedupe_consecutive(rows), vec![row(&["a"]), row(&["b"]), row(&["a"])]);
    }

    #[test]
    fn bbox_divides_span_evenly() {
        let b0 = row_bbox(800, 100, 400, 0, 3);
        let b2 = row_bbox(800, 100, 400, 2, 3);
        assert_eq!(b0, BoundingBox { x0: 0, y0: 100, x1: 800, y1: 200 });
        assert_eq!(b2, BoundingBox { x0: 0, y0: 300, x1: 800, y1: 400 });
    }

    #[test]
    fn bbox_never_exceeds_chunk_bottom() {
        for i in 0..7 {
            let b = row_bbox(10, 0, 5, i, 7);
            assert!(b.y1 <= 5 && b.y0 <= b.y1, "row {i}: {b:?}");
        }
    }

    #[test]
    fn merger_repeated_header_is_dropped() {
        let mut m = PageMerger::new(1, 100, '|');
        m.push_chunk(span(1, 0, 550), "Name | Qty\nApple | 1\n");
        m.push_chunk(span(2, 450, 1000), " Name |Qty \nPear | 2\n");
        let t = m.finish();
        assert_eq!(t.header, row(&["Name", "Qty"]));
        assert_eq!(t.rows, vec![row(&["Apple", "1"]), row(&["Pear", "2"])]);
        assert_eq!(t.row_metadata[1].chunk_index, 2);
    }

    #[test]
    fn merger_first_row_is_data_when_not_header() {
        let mut m = PageMerger::new(1, 100, '|');
        m.push_chunk(span(1, 0, 550), "Name | Qty\nApple | 1\n");
        m.push_chunk(span(2, 450, 1000), "Pear | 2\n");
        let t = m.finish();
        assert_eq!(t.rows, vec![row(&["Apple", "1"]), row(&["Pear", "2"])]);
    }

    #[test]
    fn merger_dedupes_across_overlap() {
        let mut m = PageMerger::new(1, 100, '|');
        m.push_chunk(span(1, 0, 550), "H\nx\n");
        let added = m.push_chunk(span(2, 450, 1000), "H\nx\ny\n");
        let t = m.finish();
        assert_eq!(added, 1);
        assert_eq!(t.rows, vec![row(&["x"]), row(&["y"])]);
        assert_eq!(t.row_metadata.len(), t.rows.len());
    }

    #[test]
    fn merger_only_first_surviving_row_checked_against_page() {
        let mut m = PageMerger::new(1, 100, '|');
        m.push_chunk(span(1, 0, 550), "H\nx\n");
        m.push_chunk(span(2, 450, 1000), "x\ny\nx\n");
        let t = m.finish();
        assert_eq!(t.rows, vec![row(&["x"]), row(&["y"]), row(&["x"])]);
    }

    #[test]
    fn merger_skips_empty_chunks_before_header() {
        let mut m = PageMerger::new(3, 100, '|');
        assert_eq!(m.push_chunk(span(1, 0, 550), "  \n-----\n"), 0);
        m.push_chunk(span(2, 450, 1000), "A | B | C\n1 | 2\n");
        let t = m.finish();
        assert_eq!(t.header, row(&["A", "B", "C"]));
        assert_eq!(t.rows, vec![row(&["1", "2", ""])]);
        let meta = &t.row_metadata[0];
        assert_eq!(meta.page_number, 3);
        assert_eq!(meta.chunk_index, 2);
        assert!((meta.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(meta.bbox, BoundingBox { x0: 0, y0: 450, x1: 100, y1: 1000 });
    }

    #[test]
    fn merger_empty_page() {
        let t = PageMerger::new(1, 100, '|').finish();
        assert!(t.header.is_empty());
        assert!(t.is_empty());
    }
}
