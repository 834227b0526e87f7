//! Bulk import of blotter entries from spreadsheet and CSV uploads.
//!
//! The first worksheet (or the CSV) is read into rows keyed by header name.
//! Headers are trimmed and lowercased; numeric `date` cells are spreadsheet
//! serial dates and become ISO strings. Required columns are checked on the
//! first row only, then every row is inserted in one batch.

use chrono::{Duration, NaiveDate};
use log::{debug, info};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use crate::auth::Session;
use crate::entry::{NewEntry, REQUIRED_FIELDS};
use crate::error::{BlotterError, Result, ValidationError};
use crate::session::Route;
use crate::store::RecordStore;

/// Days subtracted from a serial before counting from 1900-01-01; the
/// spreadsheet epoch is one day early and treats 1900 as a leap year
const SERIAL_DATE_OFFSET: i64 = 2;

/// One parsed cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
}

impl CellValue {
    /// Render the cell as field text; integral numbers lose the `.0`
    pub fn to_text(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                format!("{}", *n as i64)
            }
            CellValue::Number(n) => n.to_string(),
        }
    }
}

/// A data row keyed by normalized header; empty cells have no key
pub type Row = BTreeMap<String, CellValue>;

/// Supported upload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Csv,
    Workbook,
}

impl FileKind {
    /// Detect the format from the file extension
    pub fn from_filename(filename: &str) -> Result<Self> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        match extension.as_deref() {
            Some("csv") => Ok(FileKind::Csv),
            Some("xlsx") | Some("xls") => Ok(FileKind::Workbook),
            Some(ext) => Err(BlotterError::parse(format!("Unsupported file extension: {}", ext))),
            None => Err(BlotterError::parse("File has no extension")),
        }
    }
}

/// Outcome of a successful import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    /// Where the user goes next
    pub route: Route,
}

/// Convert a spreadsheet serial date to `YYYY-MM-DD`
///
/// Day zero is 1900-01-01 and two days are subtracted from the serial, so
/// serial 45292 is 2024-01-01. The time-of-day fraction is dropped.
pub fn serial_to_iso_date(serial: f64) -> Option<String> {
    if !serial.is_finite() {
        return None;
    }
    let days = serial.floor() as i64 - SERIAL_DATE_OFFSET;
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)?;
    let date = epoch.checked_add_signed(Duration::try_days(days)?)?;
    Some(date.format("%Y-%m-%d").to_string())
}

/// Trim and lowercase headers and convert the `date` cell
///
/// Empty headers and empty cells are dropped.
pub fn normalize_row<I>(cells: I) -> Row
where
    I: IntoIterator<Item = (String, CellValue)>,
{
    let mut row = Row::new();
    for (header, value) in cells {
        let key = header.trim().to_lowercase();
        if key.is_empty() || matches!(&value, CellValue::Text(s) if s.is_empty()) {
            continue;
        }
        let value = if key == "date" { normalize_date(value) } else { value };
        row.insert(key, value);
    }
    row
}

fn normalize_date(value: CellValue) -> CellValue {
    let serial = match &value {
        CellValue::Number(n) => Some(*n),
        CellValue::Text(s) => parse_number(s),
    };
    match serial.and_then(serial_to_iso_date) {
        Some(iso) => CellValue::Text(iso),
        None => value,
    }
}

/// Numeric value of a text cell, if it reads as a finite number
fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Check the required columns against the first row
///
/// Later rows are not inspected.
pub fn validate_columns(rows: &[Row]) -> Result<()> {
    let first = rows
        .first()
        .ok_or_else(|| BlotterError::parse("The file contains no data rows"))?;

    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|col| !first.contains_key(**col))
        .map(|col| col.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::MissingColumns(missing).into())
    }
}

/// Build insert payloads; absent cells become empty fields
pub fn rows_to_entries(rows: &[Row]) -> Vec<NewEntry> {
    let text = |row: &Row, key: &str| row.get(key).map(CellValue::to_text).unwrap_or_default();
    rows.iter()
        .map(|row| NewEntry {
            first_name: text(row, "first_name"),
            last_name: text(row, "last_name"),
            case_type: text(row, "case_type"),
            date: text(row, "date"),
            blotter_entry: text(row, "blotter_entry"),
        })
        .collect()
}

/// Parse CSV text into records
///
/// Quoted fields may contain commas, doubled quotes and line breaks. CRLF
/// line endings and a leading byte-order mark are accepted; blank lines are
/// skipped.
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    let mut finish_record = |record: &mut Vec<String>, field: &mut String| {
        record.push(std::mem::take(field));
        let record = std::mem::take(record);
        if !(record.len() == 1 && record[0].is_empty()) {
            records.push(record);
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    // Doubled quote inside a quoted field
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => record.push(std::mem::take(&mut field)),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => finish_record(&mut record, &mut field),
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(BlotterError::parse("Unterminated quoted field"));
    }
    if !field.is_empty() || !record.is_empty() {
        finish_record(&mut record, &mut field);
    }

    Ok(records)
}

/// Read CSV bytes into normalized rows
pub fn read_csv(bytes: &[u8]) -> Result<Vec<Row>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| BlotterError::parse(format!("CSV is not valid UTF-8: {}", e)))?;
    let mut records = parse_csv(text)?.into_iter();

    let Some(headers) = records.next() else {
        return Err(BlotterError::parse("CSV file is empty"));
    };

    Ok(records
        .map(|record| {
            normalize_row(
                headers
                    .iter()
                    .cloned()
                    .zip(record.into_iter().map(CellValue::Text)),
            )
        })
        .filter(|row| !row.is_empty())
        .collect())
}

/// Read the first worksheet of an Excel workbook into normalized rows
pub fn read_workbook(bytes: &[u8]) -> Result<Vec<Row>> {
    use calamine::{Data, Reader, open_workbook_auto_from_rs};

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;

    // Get the first worksheet
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| BlotterError::parse("No sheets found in workbook"))?;
    let range = workbook.worksheet_range(&sheet_name)?;

    let cell_value = |cell: &Data| -> Option<CellValue> {
        match cell {
            Data::Empty => None,
            Data::Int(i) => Some(CellValue::Number(*i as f64)),
            Data::Float(f) => Some(CellValue::Number(*f)),
            // Date-formatted cells carry the serial number
            Data::DateTime(dt) => Some(CellValue::Number(dt.as_f64())),
            Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => {
                Some(CellValue::Text(s.clone()))
            }
            Data::Bool(b) => Some(CellValue::Text(b.to_string())),
            Data::Error(e) => Some(CellValue::Text(e.to_string())),
        }
    };

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Err(BlotterError::parse("Worksheet is empty"));
    };
    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| cell_value(cell).map(|v| v.to_text()).unwrap_or_default())
        .collect();

    Ok(rows
        .map(|cells| {
            normalize_row(
                headers
                    .iter()
                    .zip(cells.iter())
                    .filter_map(|(h, c)| cell_value(c).map(|v| (h.clone(), v))),
            )
        })
        .filter(|row| !row.is_empty())
        .collect())
}

/// Parse an uploaded file into validated insert payloads
pub fn parse_upload(filename: &str, bytes: &[u8]) -> Result<Vec<NewEntry>> {
    let rows = match FileKind::from_filename(filename)? {
        FileKind::Csv => read_csv(bytes)?,
        FileKind::Workbook => read_workbook(bytes)?,
    };
    debug!("[IMPORT] {} parsed into {} rows", filename, rows.len());

    validate_columns(&rows)?;
    Ok(rows_to_entries(&rows))
}

/// Parse, validate and batch-insert an uploaded file
///
/// Nothing is inserted unless parsing and validation succeed.
pub async fn import_file(
    store: &dyn RecordStore,
    session: &Session,
    filename: &str,
    bytes: &[u8],
) -> Result<ImportReport> {
    let entries = parse_upload(filename, bytes)?;
    let inserted = store.insert(session, entries).await?;
    info!("[IMPORT] Imported {} entries from {}", inserted.len(), filename);

    Ok(ImportReport {
        imported: inserted.len(),
        route: Route::List,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_dates_use_the_two_day_offset() {
        assert_eq!(serial_to_iso_date(45292.0).as_deref(), Some("2024-01-01"));
        assert_eq!(serial_to_iso_date(45292.75).as_deref(), Some("2024-01-01"));
        assert_eq!(serial_to_iso_date(61.0).as_deref(), Some("1900-03-01"));
        assert_eq!(serial_to_iso_date(f64::NAN), None);
    }

    #[test]
    fn headers_are_trimmed_and_lowercased() {
        let row = normalize_row(vec![
            ("  First_Name ".to_string(), CellValue::Text("A".into())),
            ("DATE".to_string(), CellValue::Number(45292.0)),
            ("Case_Type".to_string(), CellValue::Text(String::new())),
        ]);
        assert_eq!(row.get("first_name"), Some(&CellValue::Text("A".into())));
        assert_eq!(row.get("date"), Some(&CellValue::Text("2024-01-01".into())));
        assert!(!row.contains_key("case_type"));
    }

    #[test]
    fn textual_dates_pass_through() {
        let row = normalize_row(vec![("date".to_string(), CellValue::Text("Jan 5, 2024".into()))]);
        assert_eq!(row.get("date"), Some(&CellValue::Text("Jan 5, 2024".into())));

        let row = normalize_row(vec![("date".to_string(), CellValue::Text("45292".into()))]);
        assert_eq!(row.get("date"), Some(&CellValue::Text("2024-01-01".into())));
    }

    #[test]
    fn any_finite_number_text_is_a_serial_date() {
        for text in ["45292.", "4.5292e4", " 45292.5 ", "+45292"] {
            let row = normalize_row(vec![("date".to_string(), CellValue::Text(text.into()))]);
            assert_eq!(
                row.get("date"),
                Some(&CellValue::Text("2024-01-01".into())),
                "{}",
                text
            );
        }

        for text in ["NaN", "inf", "1e400", "2024-01-01"] {
            let row = normalize_row(vec![("date".to_string(), CellValue::Text(text.into()))]);
            assert_eq!(row.get("date"), Some(&CellValue::Text(text.into())), "{}", text);
        }
    }

    #[test]
    fn numbers_render_without_trailing_zero() {
        assert_eq!(CellValue::Number(42.0).to_text(), "42");
        assert_eq!(CellValue::Number(4.5).to_text(), "4.5");
    }

    #[test]
    fn csv_quotes_commas_and_newlines() {
        let text = "\u{feff}a,b\r\n\"x, y\",\"line1\nline2 \"\"quoted\"\"\"\r\n\r\nlast,\n";
        let records = parse_csv(text).unwrap();
        assert_eq!(
            records,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["x, y".to_string(), "line1\nline2 \"quoted\"".to_string()],
                vec!["last".to_string(), String::new()],
            ]
        );
    }

    #[test]
    fn csv_unterminated_quote_is_rejected() {
        assert!(matches!(parse_csv("a\n\"open"), Err(BlotterError::Parse(_))));
    }

    #[test]
    fn missing_column_on_first_row_aborts() {
        let csv = b"first_name,last_name,date,blotter_entry\nA,B,45292,x\n";
        match parse_upload("upload.csv", csv) {
            Err(BlotterError::Validation(ValidationError::MissingColumns(cols))) => {
                assert_eq!(cols, vec!["case_type".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn only_the_first_row_is_validated() {
        let csv = b"first_name,last_name,case_type,date,blotter_entry\nA,B,Theft,45292,x\nC,,,,\n";
        let entries = parse_upload("upload.csv", csv).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].first_name, "C");
        assert_eq!(entries[1].case_type, "");
    }

    #[test]
    fn header_only_file_has_no_rows() {
        let csv = b"first_name,last_name,case_type,date,blotter_entry\n";
        assert!(matches!(parse_upload("upload.csv", csv), Err(BlotterError::Parse(_))));
    }

    #[test]
    fn unsupported_extensions_are_parse_errors() {
        assert!(matches!(FileKind::from_filename("notes.txt"), Err(BlotterError::Parse(_))));
        assert!(matches!(FileKind::from_filename("noext"), Err(BlotterError::Parse(_))));
        assert_eq!(FileKind::from_filename("Data.XLSX").unwrap(), FileKind::Workbook);
    }

    #[test]
    fn corrupt_workbook_is_a_parse_error() {
        assert!(matches!(
            parse_upload("upload.xlsx", b"definitely not a zip"),
            Err(BlotterError::Parse(_))
        ));
    }
}
