//! Legacy single-document format handler.
//!
//! Drives one forward scan of `data.json`. Small sections import as their
//! values arrive, in document order. Places flush directly from an
//! in-memory batch — place creation needs no other section's data. Visits
//! and points are staged to spool files and replayed after the scan, when
//! everything they resolve against already exists.

use std::fs::File;
use std::path::{Path, PathBuf};

use geotrail_core::{EntityKind, ImportStats, RawRecord};
use geotrail_store_sqlite::Store;
use serde_json::Value;

use crate::entities;
use crate::lookup::ReferenceCache;
use crate::points::PointImporter;
use crate::scanner::{scan_document, SectionSink};
use crate::spool::SectionSpool;
use crate::tracker::RunTracker;
use crate::{ImportError, DOCUMENT_FILE, FILES_DIR};

/// Sections delivered element-by-element instead of as whole values.
const STREAMED_SECTIONS: [&str; 3] = ["places", "visits", "points"];

/// Run a legacy import from an extracted archive root.
///
/// # Errors
/// Returns an error for a malformed document or a storage failure that
/// escalates past a single record.
pub fn run(
    store: &mut Store,
    user_id: i64,
    root: &Path,
    batch_size: usize,
    tracker: &RunTracker,
) -> Result<ImportStats, ImportError> {
    let document = File::open(root.join(DOCUMENT_FILE))?;
    let mut handler = LegacyHandler {
        store,
        user_id,
        files_dir: root.join(FILES_DIR),
        batch_size,
        stats: ImportStats::default(),
        place_batch: Vec::new(),
        visit_spool: SectionSpool::create(root, "visits")?,
        point_spool: SectionSpool::create(root, "points")?,
    };
    scan_document(document, &STREAMED_SECTIONS, &mut handler)?;
    tracker.checkpoint("legacy document scanned");
    handler.finish(tracker)
}

struct LegacyHandler<'a> {
    store: &'a mut Store,
    user_id: i64,
    files_dir: PathBuf,
    batch_size: usize,
    stats: ImportStats,
    place_batch: Vec<RawRecord>,
    visit_spool: SectionSpool,
    point_spool: SectionSpool,
}

impl LegacyHandler<'_> {
    fn flush_places(&mut self) {
        if self.place_batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.place_batch);
        entities::import_places(self.store, &batch, &mut self.stats);
    }

    fn finish(self, tracker: &RunTracker) -> Result<ImportStats, ImportError> {
        let Self {
            store,
            user_id,
            batch_size,
            mut stats,
            place_batch,
            visit_spool,
            point_spool,
            ..
        } = self;
        // The end-of-section signal already flushed places; this only
        // matters if the document had no places section at all.
        if !place_batch.is_empty() {
            entities::import_places(store, &place_batch, &mut stats);
        }

        let staged_visits = visit_spool.staged();
        visit_spool.replay_batches(batch_size, |batch| {
            entities::import_visits(store, user_id, &batch, &mut stats)
        })?;
        tracing::debug!(staged_visits, "replayed staged visits");
        tracker.checkpoint("visits replayed");

        let cache = ReferenceCache::load(store, user_id)?;
        let mut importer = PointImporter::new(store, user_id, &cache, batch_size);
        point_spool.replay_batches(batch_size, |batch| importer.push_all(batch))?;
        let outcome = importer.finalize()?;
        stats.points_created += outcome.created;
        stats.points_skipped += outcome.skipped;
        tracker.checkpoint("points replayed");

        Ok(stats)
    }

    fn value_records(section: &str, value: Value) -> Vec<RawRecord> {
        match value {
            // The settings section is one document, not a list.
            Value::Object(map) => vec![RawRecord(map)],
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| {
                    let record = RawRecord::from_value(item);
                    if record.is_none() {
                        tracing::warn!(section, "skipping element that is not an object");
                    }
                    record
                })
                .collect(),
            _ => {
                tracing::warn!(section, "section is neither an object nor an array, skipping");
                Vec::new()
            }
        }
    }
}

impl SectionSink for LegacyHandler<'_> {
    fn on_section_value(&mut self, section: &str, value: Value) -> Result<(), ImportError> {
        if section == "counts" {
            tracing::info!(counts = %value, "archive self-reported counts");
            return Ok(());
        }
        let Some(kind) = EntityKind::from_section(section) else {
            tracing::debug!(section, "ignoring unknown section");
            return Ok(());
        };
        let records = Self::value_records(section, value);
        entities::import_batch(
            self.store,
            self.user_id,
            kind,
            &records,
            &self.files_dir,
            &mut self.stats,
        )
    }

    fn on_section_element(&mut self, section: &str, element: Value) -> Result<(), ImportError> {
        match section {
            "places" => {
                if let Some(record) = RawRecord::from_value(element) {
                    self.place_batch.push(record);
                    if self.place_batch.len() >= self.batch_size {
                        self.flush_places();
                    }
                } else {
                    tracing::warn!("skipping place element that is not an object");
                }
                Ok(())
            }
            "visits" => self.visit_spool.append(&element),
            "points" => self.point_spool.append(&element),
            _ => Ok(()),
        }
    }

    fn on_section_end(&mut self, section: &str) -> Result<(), ImportError> {
        match section {
            "places" => self.flush_places(),
            "visits" => {
                tracing::debug!(staged = self.visit_spool.staged(), "visits section ended");
            }
            "points" => {
                tracing::debug!(staged = self.point_spool.staged(), "points section ended");
            }
            _ => {}
        }
        Ok(())
    }
}
