use log::debug;
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::auth::Session;
use crate::entry::BlotterEntry;
use crate::error::{BlotterError, Result};
use crate::store::{ListQuery, RecordStore};

/// Rows requested per page while collecting an export
pub const EXPORT_BATCH: usize = 1000;

/// Column order of exported files; the importer reads the same headers
pub const EXPORT_COLUMNS: [&str; 7] = [
    "id",
    "first_name",
    "last_name",
    "case_type",
    "date",
    "blotter_entry",
    "created_at",
];

/// Download formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "csv" => Some(ExportFormat::Csv),
            "xlsx" => Some(ExportFormat::Xlsx),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "blotter.csv",
            ExportFormat::Xlsx => "blotter.xlsx",
        }
    }
}

/// Collect every entry, newest first, for a download
pub async fn fetch_all(store: &dyn RecordStore, session: &Session) -> Result<Vec<BlotterEntry>> {
    fetch_all_in_batches(store, session, EXPORT_BATCH).await
}

/// Page through the store `batch` rows at a time until the reported total is reached
///
/// The server may return fewer rows than asked for (row caps), so the offset
/// advances by what actually came back.
///
/// # Errors
/// * `BlotterError::Transport` if the pages run out before the total is reached
pub async fn fetch_all_in_batches(
    store: &dyn RecordStore,
    session: &Session,
    batch: usize,
) -> Result<Vec<BlotterEntry>> {
    let batch = batch.max(1);
    let mut entries: Vec<BlotterEntry> = Vec::new();

    loop {
        let page = store
            .list(session, &ListQuery::default().range(entries.len(), batch))
            .await?;
        let total = page.total;
        let received = page.entries.len();
        entries.extend(page.entries);
        debug!("[STORE] Export collected {}/{} entries", entries.len(), total);

        if entries.len() >= total {
            return Ok(entries);
        }
        if received == 0 {
            return Err(BlotterError::transport(format!(
                "Export incomplete: received {} of {} entries",
                entries.len(),
                total
            )));
        }
    }
}

fn row(entry: &BlotterEntry) -> [String; 7] {
    [
        entry.id.to_string(),
        entry.first_name.clone(),
        entry.last_name.clone(),
        entry.case_type.clone(),
        entry.date.clone(),
        entry.blotter_entry.clone(),
        entry.created_at.clone(),
    ]
}

fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Convert entries to CSV
///
/// The first line holds the column names. Fields containing commas, quotes
/// or line breaks are quoted.
pub fn to_csv(entries: &[BlotterEntry]) -> String {
    let mut csv_content = EXPORT_COLUMNS.join(",");
    csv_content.push('\n');

    for entry in entries {
        let fields: Vec<String> = row(entry).iter().map(|v| escape_csv(v)).collect();
        csv_content.push_str(&fields.join(","));
        csv_content.push('\n');
    }

    csv_content
}

/// Convert entries to an XLSX workbook with a single worksheet
///
/// Every cell is written as text so dates keep their ISO form.
pub fn to_xlsx(entries: &[BlotterEntry]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    worksheet.set_name("Blotter")?;

    for (c, name) in EXPORT_COLUMNS.iter().enumerate() {
        worksheet.write_string(0, c as u16, *name)?;
    }

    for (r, entry) in entries.iter().enumerate() {
        let r = (r + 1) as u32;
        worksheet.write_number(r, 0, entry.id as f64)?;
        for (c, value) in row(entry).iter().enumerate().skip(1) {
            worksheet.write_string(r, c as u16, value.as_str())?;
        }
    }

    workbook.push_worksheet(worksheet);
    Ok(workbook.save_to_buffer()?)
}
