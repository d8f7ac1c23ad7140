use std::path::Path;

use tracing::debug;

use crate::errors::{AppError, AppResult};

const TITLE_COLUMNS: &[&str] = &["title", "titel", "name"];
const URL_COLUMNS: &[&str] = &["url", "link"];

/// One data row of the location export, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub row: usize,
    pub title: String,
    pub url: String,
}

impl RawRecord {
    pub fn new(row: usize, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            row,
            title: title.into(),
            url: url.into(),
        }
    }

    pub fn label(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.url
        } else {
            self.title.trim()
        }
    }
}

pub fn read_csv_file(path: &Path) -> AppResult<Vec<RawRecord>> {
    if !path.is_file() {
        return Err(AppError::InputNotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    parse_csv(&bytes)
}

pub fn parse_csv(bytes: &[u8]) -> AppResult<Vec<RawRecord>> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    let title_idx = find_column(&headers, TITLE_COLUMNS);
    let url_idx = find_column(&headers, URL_COLUMNS);
    if title_idx.is_none() && url_idx.is_none() {
        return Err(AppError::Config(format!(
            "CSV has neither a title nor a URL column (headers: {})",
            headers.iter().collect::<Vec<_>>().join(", ")
        )));
    }

    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        let cell = |column: Option<usize>| {
            column
                .and_then(|i| row.get(i))
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        };
        let title = cell(title_idx);
        let url = cell(url_idx);
        if title.is_empty() && url.is_empty() {
            debug!(row = idx + 1, "skipping empty export row");
            continue;
        }
        records.push(RawRecord::new(idx + 1, title, url));
    }

    Ok(records)
}

fn find_column(headers: &csv::StringRecord, candidates: &[&str]) -> Option<usize> {
    candidates.iter().find_map(|candidate| {
        headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case(candidate))
    })
}
