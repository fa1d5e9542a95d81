//! Flow dump files.
//!
//! A dump is JSON Lines: one serialized [`Flow`] per line. Blank lines are
//! ignored so that dumps can be concatenated by hand.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::Path;

use super::Flow;
use crate::error::{PermDumpError, Result};

/// Appends flows to a dump.
pub struct FlowWriter<W: Write> {
    inner: W,
}

impl FlowWriter<Box<dyn Write + Send>> {
    /// Create (or truncate) a dump file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(Box::new(BufWriter::new(file))))
    }
}

impl<W: Write> FlowWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one flow and flush it to the underlying writer.
    pub fn add(&mut self, flow: &Flow) -> Result<()> {
        serde_json::to_writer(&mut self.inner, flow)?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Iterates over the flows stored in a dump.
pub struct FlowReader<R: BufRead> {
    lines: Lines<R>,
    line_no: usize,
}

impl FlowReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> FlowReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for FlowReader<R> {
    type Item = Result<Flow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&line).map_err(|source| PermDumpError::FlowFormat {
                    line: self.line_no,
                    source,
                }),
            );
        }
    }
}
