//! Source loading: type detection, tabular parsing (CSV, Excel) and document
//! text extraction (PDF, DOCX, plain text).
//!
//! Tabular sources come back as a [`RawTable`] directly. Documents are turned
//! into lines and handed to the key-value extractor.

use crate::error::ProcessingError;
use crate::kv_extractor;
use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// Parsed source data before reconciliation. Cells are strings; an empty
/// string means the source had no value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() || self.rows.is_empty()
    }

    /// Column index of a header, exact match.
    pub fn column(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == header)
    }
}

/// How a detected file is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Csv,
    Excel,
    Pdf,
    Docx,
    Text,
}

impl SourceKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "xlsx" | "xlsm" | "xlsb" | "xls" => Some(Self::Excel),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" => Some(Self::Text),
            _ => None,
        }
    }
}

/// Lower-cased extension of a path, empty if none.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Detect `(mime type, extension)` of a stored file.
///
/// CSV short-circuits on the extension. Everything else is sniffed from the
/// magic bytes; generic zip containers fall back to the extension, and plain
/// text (which has no signature) is accepted on a `.txt` extension.
pub fn detect_file_type(path: &Path) -> Result<(String, String), ProcessingError> {
    let ext = extension_of(path);
    if ext == "csv" {
        return Ok(("text/csv".to_string(), ext));
    }

    let kind = infer::get_from_path(path).map_err(|e| ProcessingError::Detection {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    match kind {
        Some(kind) if kind.extension() == "zip" => {
            let mime = match ext.as_str() {
                "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "xlsx" | "xlsm" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                _ => "application/zip",
            };
            debug!("Zip container {:?} resolved by extension: {}", path, ext);
            Ok((mime.to_string(), ext))
        }
        Some(kind) => Ok((kind.mime_type().to_string(), kind.extension().to_string())),
        None if ext == "txt" => Ok(("text/plain".to_string(), ext)),
        None => Err(ProcessingError::Detection {
            path: path.to_path_buf(),
            reason: "unrecognized file signature".to_string(),
        }),
    }
}

/// Detect and load a source into a table.
///
/// Detection failures propagate. A source of a known kind that fails to parse
/// degrades to an empty table so the pass ends as a zero-record rejection.
pub fn load_source(path: &Path) -> Result<RawTable, ProcessingError> {
    let (mime, ext) = detect_file_type(path)?;
    let kind = SourceKind::from_extension(&ext)
        .or_else(|| SourceKind::from_extension(&extension_of(path)))
        .ok_or_else(|| ProcessingError::UnsupportedType(ext.clone()))?;
    info!("Detected {:?} as {} ({:?})", path, mime, kind);
    Ok(load_as(path, kind))
}

/// Load a source whose kind is already known.
pub fn load_as(path: &Path, kind: SourceKind) -> RawTable {
    let name = table_name(path);
    let loaded = match kind {
        SourceKind::Csv => parse_csv(&name, path),
        SourceKind::Excel => parse_excel(path).or_else(|e| {
            warn!("Failed to read workbook {:?} as a table ({:#}), trying as document", path, e);
            document_table(&name, path, SourceKind::Text)
        }),
        SourceKind::Pdf | SourceKind::Docx | SourceKind::Text => document_table(&name, path, kind),
    };

    match loaded {
        Ok(table) => {
            info!(
                "Loaded '{}': {} columns, {} rows",
                table.name,
                table.headers.len(),
                table.rows.len()
            );
            table
        }
        Err(e) => {
            warn!("Failed to load {:?} as {:?}: {:#}", path, kind, e);
            RawTable::empty(&name)
        }
    }
}

fn table_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("source")
        .to_string()
}

// ============================================================================
// Tabular
// ============================================================================

/// Parse a CSV file. Rows may be ragged; short rows are padded with empty cells.
fn parse_csv(name: &str, path: &Path) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV {:?}", path))?;

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.is_empty() {
        anyhow::bail!("CSV file has no headers");
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.context("Failed to read CSV record")?;
        let mut row: Vec<String> = record.iter().map(|f| f.trim().to_string()).collect();
        if row.iter().all(|v| v.is_empty()) {
            continue;
        }
        row.resize(headers.len(), String::new());
        rows.push(row);
    }

    Ok(RawTable {
        name: name.to_string(),
        headers,
        rows,
    })
}

/// Parse the first worksheet that has a header row and at least one data row.
fn parse_excel(path: &Path) -> Result<RawTable> {
    let mut workbook = open_workbook_auto(path).context("Failed to open Excel workbook")?;
    let sheet_names = workbook.sheet_names();

    for name in &sheet_names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping sheet '{}': {}", name, e);
                continue;
            }
        };

        if let Some(table) = range_to_table(name, &range) {
            return Ok(table);
        }
    }

    anyhow::bail!("No sheets with data found in workbook")
}

/// First row = headers. `None` for sheets without headers or data rows.
fn range_to_table(name: &str, range: &calamine::Range<Data>) -> Option<RawTable> {
    let mut row_iter = range.rows();

    let headers: Vec<String> = row_iter.next()?.iter().map(cell_to_string).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return None;
    }

    let rows: Vec<Vec<String>> = row_iter
        .map(|row| {
            let mut values: Vec<String> = row.iter().map(cell_to_string).collect();
            values.resize(headers.len(), String::new());
            values
        })
        .filter(|values| !values.iter().all(|v| v.is_empty()))
        .collect();

    if rows.is_empty() {
        return None;
    }

    Some(RawTable {
        name: name.to_string(),
        headers,
        rows,
    })
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => format_float(*f),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => format_float(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

/// Whole numbers without a trailing ".0" (match counts, runs).
fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

// ============================================================================
// Documents
// ============================================================================

/// Run a document's lines through the key-value extractor.
fn document_table(name: &str, path: &Path, kind: SourceKind) -> Result<RawTable> {
    let lines = document_lines(path, kind)?;
    let records = kv_extractor::extract_records(&lines);
    debug!("Extracted {} key-value block(s) from {} lines", records.len(), lines.len());
    Ok(kv_extractor::records_to_table(name, &records))
}

/// Text lines of a document, pages and paragraphs concatenated in order.
fn document_lines(path: &Path, kind: SourceKind) -> Result<Vec<String>> {
    let text = match kind {
        SourceKind::Pdf => pdf_text(path)?,
        SourceKind::Docx => docx_text(path)?,
        _ => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read text file {:?}", path))?,
    };
    Ok(text.lines().map(str::to_string).collect())
}

fn pdf_text(path: &Path) -> Result<String> {
    let doc = lopdf::Document::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;

    let mut text = String::new();
    for (page_num, _) in doc.get_pages() {
        match doc.extract_text(&[page_num]) {
            Ok(content) => {
                text.push_str(&content);
                text.push('\n');
            }
            Err(e) => warn!("Skipping PDF page {}: {}", page_num, e),
        }
    }
    Ok(text)
}

/// Paragraph text of `word/document.xml`, one paragraph per line.
fn docx_text(path: &Path) -> Result<String> {
    use quick_xml::events::Event;

    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut archive = zip::ZipArchive::new(file).context("DOCX is not a zip archive")?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX has no word/document.xml")?
        .read_to_string(&mut xml)?;

    let mut reader = quick_xml::Reader::from_str(&xml);
    let mut text = String::new();
    loop {
        match reader.read_event().context("Malformed DOCX XML")? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::Empty(e) if e.name().as_ref() == b"w:tab" => text.push(' '),
            Event::Empty(e) if e.name().as_ref() == b"w:br" => text.push('\n'),
            Event::End(e) if e.name().as_ref() == b"w:p" => text.push('\n'),
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_parse_csv_basic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "stats.csv", b"p_name,runs,mat\nKohli,8676,111\nRoot,11000,130\n");
        let table = load_source(&path).unwrap();
        assert_eq!(table.name, "stats");
        assert_eq!(table.headers, vec!["p_name", "runs", "mat"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1], vec!["Root", "11000", "130"]);
    }

    #[test]
    fn test_parse_csv_pads_short_rows_and_skips_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "flex.csv", b"a,b,c\n1,2,3\n4,5\n,,\n");
        let table = load_source(&path).unwrap();
        assert_eq!(table.rows, vec![vec!["1", "2", "3"], vec!["4", "5", ""]]);
    }

    #[test]
    fn test_text_document_goes_through_kv_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "players.txt",
            b"Name: Joe Root\nMatches: 130\n\nName: Kane Williamson\nMatches: 94\n",
        );
        let table = load_source(&path).unwrap();
        assert_eq!(table.headers, vec!["Name", "Matches"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1], vec!["Kane Williamson", "94"]);
    }

    #[test]
    fn test_unrecognized_signature_is_detection_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "blob.bin", b"just some words, not a known format");
        assert!(matches!(
            detect_file_type(&path),
            Err(ProcessingError::Detection { .. })
        ));
    }

    #[test]
    fn test_corrupt_pdf_degrades_to_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "broken.pdf", b"%PDF-1.4\nthis is not really a pdf");
        let table = load_as(&path, SourceKind::Pdf);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unreadable_workbook_is_read_as_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "card.xlsx", b"Player: A\nRuns: 120\nPlayer: B\nRuns: 45\n");
        let table = load_as(&path, SourceKind::Excel);
        assert_eq!(table.headers, vec!["Player", "Runs"]);
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn test_binary_garbage_workbook_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "junk.xlsx", &[0xff, 0xfe, 0x00, 0x9f, 0x80]);
        assert!(load_as(&path, SourceKind::Excel).is_empty());
    }

    #[test]
    fn test_source_kind_from_extension() {
        assert_eq!(SourceKind::from_extension("XLSX"), Some(SourceKind::Excel));
        assert_eq!(SourceKind::from_extension("docx"), Some(SourceKind::Docx));
        assert_eq!(SourceKind::from_extension("exe"), None);
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(111.0), "111");
        assert_eq!(format_float(53.41), "53.41");
    }
}
