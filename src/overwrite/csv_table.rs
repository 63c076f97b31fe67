// pgsqltool/src/overwrite/csv_table.rs
use csv::ReaderBuilder;
use std::collections::HashSet;

use crate::errors::{AppError, Result};

/// A query result captured as CSV: a header of unique column names followed by
/// data rows of the same arity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvTable {
    /// Parses `COPY ... TO STDOUT WITH CSV HEADER` output. Lines starting with
    /// `comment` are skipped.
    ///
    /// Blank lines are skipped by the reader. In a single-column snapshot a
    /// blank line is a NULL row, so there it is rejected as invalid input
    /// rather than dropped.
    pub fn parse(text: &str, comment: Option<u8>) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(comment)
            .from_reader(text.as_bytes());

        let mut records = reader.records();
        let header: Vec<String> = match records.next() {
            Some(record) => record?.iter().map(str::to_string).collect(),
            None => return Err(AppError::InvalidInput("CSV input has no header row".to_string())),
        };

        let mut rows = Vec::new();
        let mut lines = Vec::new();
        for record in records {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            lines.push((line, record.len()));
            rows.push(record.iter().map(str::to_string).collect());
        }
        Self::validate(&header, lines)?;
        if header.len() == 1 {
            if let Some(line) = first_blank_line(text, comment) {
                return Err(AppError::InvalidInput(format!(
                    "line {} is blank; a single-column snapshot cannot tell an empty value from a skipped line",
                    line
                )));
            }
        }
        Ok(CsvTable { header, rows })
    }

    /// Header columns must be unique and every data row must match the
    /// header's arity; line numbers are 1-based with the header on line 1.
    fn validate(header: &[String], lines: impl IntoIterator<Item = (u64, usize)>) -> Result<()> {
        if header.is_empty() || header.iter().all(|h| h.is_empty()) {
            return Err(AppError::InvalidInput("CSV header has no columns".to_string()));
        }
        let mut seen = HashSet::new();
        for column in header {
            if !seen.insert(column.as_str()) {
                return Err(AppError::InvalidInput(format!(
                    "CSV header repeats column '{}'",
                    column
                )));
            }
        }
        for (line, found) in lines {
            if found != header.len() {
                return Err(AppError::MalformedRow {
                    line,
                    expected: header.len(),
                    found,
                });
            }
        }
        Ok(())
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// The first column, used as the row key.
    pub fn key_column(&self) -> &str {
        &self.header[0]
    }
}

/// 1-based number of the first blank line after the header, ignoring
/// newlines inside quoted fields and comment lines.
fn first_blank_line(text: &str, comment: Option<u8>) -> Option<u64> {
    let bytes = text.as_bytes();
    let mut line = 1u64;
    let mut in_quotes = false;
    let mut seen_header = false;
    let mut i = 0;

    while i < bytes.len() {
        if !in_quotes {
            let rest = &bytes[i..];
            if rest.starts_with(b"\n") || rest.starts_with(b"\r\n") {
                if seen_header {
                    return Some(line);
                }
            } else if comment == Some(rest[0]) {
                match rest.iter().position(|b| *b == b'\n') {
                    Some(end) => {
                        i += end + 1;
                        line += 1;
                        continue;
                    }
                    None => break,
                }
            } else {
                seen_header = true;
            }
        }
        while i < bytes.len() && bytes[i] != b'\n' {
            if bytes[i] == b'"' {
                in_quotes = !in_quotes;
            }
            i += 1;
        }
        i += 1;
        line += 1;
    }
    None
}
