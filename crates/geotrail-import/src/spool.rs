//! Disk-backed staging for large, order-dependent legacy sections.
//!
//! Visits and points interleave with the sections their resolution depends
//! on, so they are appended to a line-delimited temp file as they stream by
//! and replayed in fixed-size batches after the whole document is parsed.
//! The spool lives in the run's scratch directory and disappears with it.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use geotrail_core::RawRecord;
use serde_json::Value;

use crate::ImportError;

/// Append-then-replay NDJSON staging file for one streamed section.
pub struct SectionSpool {
    section: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    staged: u64,
}

impl SectionSpool {
    /// Create the staging file under `dir`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be created.
    pub fn create(dir: &Path, section: &str) -> Result<Self, ImportError> {
        let path = dir.join(format!("{section}.staging.ndjson"));
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self { section: section.to_string(), path, writer: Some(writer), staged: 0 })
    }

    /// Append one streamed element as it arrives.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn append(&mut self, element: &Value) -> Result<(), ImportError> {
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, element)?;
            writer.write_all(b"\n")?;
            self.staged += 1;
        }
        Ok(())
    }

    /// Number of staged elements.
    #[must_use]
    pub fn staged(&self) -> u64 {
        self.staged
    }

    /// Replay the staged elements through `handle` in batches of
    /// `batch_size` decoded records. Elements that are not JSON objects are
    /// skipped with a warning; they cannot carry a record.
    ///
    /// # Errors
    /// Returns an error when the staging file cannot be read back or the
    /// batch handler fails.
    pub fn replay_batches<F>(
        mut self,
        batch_size: usize,
        mut handle: F,
    ) -> Result<(), ImportError>
    where
        F: FnMut(Vec<RawRecord>) -> Result<(), ImportError>,
    {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut batch = Vec::with_capacity(batch_size.min(4096));
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record = serde_json::from_str::<Value>(&line)
                .ok()
                .and_then(RawRecord::from_value);
            match record {
                Some(record) => batch.push(record),
                None => {
                    tracing::warn!(section = %self.section, "skipping staged element that is not an object");
                    continue;
                }
            }
            if batch.len() >= batch_size {
                handle(std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            handle(batch)?;
        }
        Ok(())
    }
}
