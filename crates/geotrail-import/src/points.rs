//! Buffered importer for the highest-volume kind.
//!
//! Accepts records one at a time (staged-section replay, monthly shards) or
//! in bulk, buffers them to a batch size, and flushes each batch as one
//! conflict-skipping bulk write. Deduplication belongs to the storage
//! engine's unique index; the created tally only ever grows by the rows a
//! flush actually inserted.

use geotrail_core::{wkt_point, RawRecord};
use geotrail_store_sqlite::{PointRow, Store};

use crate::lookup::ReferenceCache;
use crate::ImportError;

/// Outcome of a finalized point import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointImportOutcome {
    /// Rows the storage engine actually inserted.
    pub created: u64,
    /// Records dropped before the write: missing timestamp or position, or
    /// attribute preparation failed.
    pub skipped: u64,
}

/// Streaming point importer for one run.
pub struct PointImporter<'a> {
    store: &'a mut Store,
    user_id: i64,
    cache: &'a ReferenceCache,
    batch_size: usize,
    batch: Vec<PointRow>,
    outcome: PointImportOutcome,
}

impl<'a> PointImporter<'a> {
    pub fn new(
        store: &'a mut Store,
        user_id: i64,
        cache: &'a ReferenceCache,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            user_id,
            cache,
            batch_size: batch_size.max(1),
            batch: Vec::new(),
            outcome: PointImportOutcome::default(),
        }
    }

    /// Accept one record, flushing when the buffer reaches the batch size.
    ///
    /// # Errors
    /// Returns an error when a triggered flush fails at the storage engine.
    pub fn push(&mut self, record: RawRecord) -> Result<(), ImportError> {
        match self.prepare(record) {
            Some(row) => self.batch.push(row),
            None => self.outcome.skipped += 1,
        }
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Accept a bulk collection.
    ///
    /// # Errors
    /// Returns an error when a triggered flush fails at the storage engine.
    pub fn push_all(
        &mut self,
        records: impl IntoIterator<Item = RawRecord>,
    ) -> Result<(), ImportError> {
        for record in records {
            self.push(record)?;
        }
        Ok(())
    }

    /// Flush the remaining buffer and return the tallies.
    ///
    /// # Errors
    /// Returns an error when the final flush fails at the storage engine.
    pub fn finalize(mut self) -> Result<PointImportOutcome, ImportError> {
        self.flush()?;
        Ok(self.outcome)
    }

    fn flush(&mut self) -> Result<(), ImportError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let submitted = batch.len();
        let inserted = self.store.bulk_insert_points(self.user_id, &batch)?;
        self.outcome.created += inserted;
        tracing::debug!(submitted, inserted, "flushed point batch");
        Ok(())
    }

    /// Validate and normalize one record to the uniform row shape.
    ///
    /// Acceptance needs a timestamp and a position — a ready-made geometry
    /// string or a latitude/longitude pair. Unresolved references leave the
    /// foreign key unset; they never fail the record.
    fn prepare(&self, record: RawRecord) -> Option<PointRow> {
        let mut record = record;
        let Some(timestamp) = record.i64_field("timestamp") else {
            tracing::debug!("point without timestamp skipped");
            return None;
        };
        let geometry = match record.str_field("geometry") {
            Some(geometry) => geometry.to_string(),
            None => {
                let (Some(latitude), Some(longitude)) =
                    (record.f64_field("latitude"), record.f64_field("longitude"))
                else {
                    tracing::debug!(timestamp, "point without position skipped");
                    return None;
                };
                wkt_point(longitude, latitude)
            }
        };

        let import_id = record
            .take_reference("import_reference")
            .and_then(|reference| self.cache.resolve_import(&reference));
        let country_id = record
            .take_reference("country_reference")
            .and_then(|reference| self.cache.resolve_country(&reference));
        let visit_id = record
            .take_reference("visit_reference")
            .and_then(|reference| self.cache.resolve_visit(&reference));
        let device_id = record.key_field("device_id").unwrap_or_default();

        record.strip_bookkeeping();
        Some(PointRow {
            geometry,
            timestamp,
            device_id,
            import_id,
            country_id,
            visit_id,
            // No track reference payload exists in either archive layout.
            track_id: None,
            payload: record.payload_json(),
        })
    }
}
