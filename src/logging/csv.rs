//! CSV flat file of permission failures.
//!
//! Columns are fixed: `UserAgent,ObjectType,ObjectName,PrivilegeMissing`.
//! Rows end in CRLF and fields are quoted only when they contain a comma,
//! quote or line break.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::addon::permission::PermissionFailure;
use crate::error::Result;

pub const HEADER: [&str; 4] = ["UserAgent", "ObjectType", "ObjectName", "PrivilegeMissing"];

/// Writes one row per recorded failure.
pub struct CsvWriter<W: Write> {
    inner: W,
}

impl CsvWriter<Box<dyn Write + Send>> {
    /// Create (or truncate) a CSV file and write the header row.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = Self::new(Box::new(BufWriter::new(file)));
        writer.write_header()?;
        Ok(writer)
    }
}

impl<W: Write> CsvWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.write_fields(&HEADER)
    }

    /// Append a row and flush it.
    pub fn write_failure(&mut self, failure: &PermissionFailure) -> Result<()> {
        self.write_fields(&[
            failure.user_agent.as_str(),
            failure.object_type.as_deref().unwrap_or(""),
            failure.object_name.as_deref().unwrap_or(""),
            failure.privilege_missing.as_deref().unwrap_or(""),
        ])
    }

    fn write_fields(&mut self, fields: &[&str]) -> Result<()> {
        let row: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        self.inner.write_all(row.join(",").as_bytes())?;
        self.inner.write_all(b"\r\n")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Render a flat-file table of failures, header included.
pub fn to_csv_string(failures: &[PermissionFailure]) -> Result<String> {
    let mut writer = CsvWriter::new(Vec::new());
    writer.write_header()?;
    for failure in failures {
        writer.write_failure(failure)?;
    }
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

/// Escape a value for CSV (handle commas, quotes, newlines)
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
