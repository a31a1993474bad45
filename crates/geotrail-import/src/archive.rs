//! Run coordinator: extraction, layout detection, dispatch, completion.

use std::fs::File;
use std::path::Path;

use geotrail_core::ImportStats;
use geotrail_store_sqlite::Store;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use zip::ZipArchive;

use crate::tracker::RunTracker;
use crate::{current, legacy, ImportError, DEFAULT_BATCH_SIZE};

/// Marker file of the current sharded layout.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Marker file of the legacy single-document layout.
pub const DOCUMENT_FILE: &str = "data.json";
/// Directory of restorable file payloads, common to both layouts.
pub const FILES_DIR: &str = "files";

/// Tunables for one import run.
#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    /// Records per storage flush for point batches and staged replay.
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE }
    }
}

/// Import one user archive into the store.
///
/// Extracts the archive to a scratch directory, detects the layout by its
/// marker file, and runs the matching handler. On success a completion
/// notification carrying the tallies is written for the user, and the
/// tallies are returned. The scratch directory is removed when the run
/// ends, successfully or not.
///
/// # Errors
/// Returns an error for an unreadable or unrecognized archive, an
/// unsupported manifest version, a malformed document, or a storage
/// failure that escalates past a single record.
pub fn import_archive(
    store: &mut Store,
    user_id: i64,
    archive_path: &Path,
    options: &ImportOptions,
) -> Result<ImportStats, ImportError> {
    let tracker = RunTracker::new("import");
    tracing::info!(user_id, archive = %archive_path.display(), "starting archive import");

    let scratch = tempfile::tempdir()?;
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    archive.extract(scratch.path())?;
    tracker.checkpoint("archive extracted");

    let root = scratch.path();
    let outcome = if root.join(MANIFEST_FILE).is_file() {
        current::run(store, user_id, root, options.batch_size, &tracker)
    } else if root.join(DOCUMENT_FILE).is_file() {
        legacy::run(store, user_id, root, options.batch_size, &tracker)
    } else {
        Err(ImportError::UnrecognizedFormat)
    };
    let stats = match outcome {
        Ok(stats) => stats,
        Err(err) => {
            record_failure(store, user_id, &err);
            return Err(err);
        }
    };

    record_completion(store, user_id, &stats)?;
    tracker.checkpoint("import finished");
    tracing::info!(
        user_id,
        created = stats.total_created(),
        points_skipped = stats.points_skipped,
        "archive import finished"
    );
    Ok(stats)
}

/// Best effort: the run error is what the caller must see, so a failed
/// notification write only warns.
fn record_failure(store: &Store, user_id: i64, err: &ImportError) {
    let payload = serde_json::json!({ "error": err.to_string() }).to_string();
    if let Err(write_err) =
        store.create_notification(user_id, "Import failed", &now_rfc3339(), &payload)
    {
        tracing::warn!(user_id, %write_err, "could not record failure notification");
    }
}

fn record_completion(
    store: &Store,
    user_id: i64,
    stats: &ImportStats,
) -> Result<(), ImportError> {
    let payload = serde_json::to_string(stats)?;
    store.create_notification(user_id, "Import completed", &now_rfc3339(), &payload)?;
    Ok(())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrail_core::EntityKind;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &str)]) -> Result<tempfile::NamedTempFile, ImportError> {
        let file = tempfile::NamedTempFile::new()?;
        let mut writer = zip::ZipWriter::new(file.reopen()?);
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default())?;
            writer.write_all(body.as_bytes())?;
        }
        writer.finish()?;
        Ok(file)
    }

    fn store() -> Result<Store, ImportError> {
        let mut store = Store::open_in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn archive_without_marker_file_is_unrecognized() -> Result<(), ImportError> {
        let zip = build_zip(&[("readme.txt", "hello")])?;
        let mut store = store()?;
        let result = import_archive(&mut store, 1, zip.path(), &ImportOptions::default());
        assert!(matches!(result, Err(ImportError::UnrecognizedFormat)));
        Ok(())
    }

    #[test]
    fn garbage_file_is_a_zip_error() -> Result<(), ImportError> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"this is not a zip archive")?;
        let mut store = store()?;
        let result = import_archive(&mut store, 1, file.path(), &ImportOptions::default());
        assert!(matches!(result, Err(ImportError::Zip(_))));
        Ok(())
    }

    #[test]
    fn fatal_run_error_records_a_failure_notification() -> Result<(), ImportError> {
        let zip = build_zip(&[(DOCUMENT_FILE, r#"{"areas": [{"name""#)])?;
        let mut store = store()?;
        let result = import_archive(&mut store, 1, zip.path(), &ImportOptions::default());
        assert!(matches!(result, Err(ImportError::MalformedDocument(_))));
        assert_eq!(store.count_rows(EntityKind::Notifications, 1)?, 1);
        Ok(())
    }

    #[test]
    fn legacy_archive_imports_and_notifies() -> Result<(), ImportError> {
        let zip = build_zip(&[(
            DOCUMENT_FILE,
            r#"{"areas": [{"name": "Home", "latitude": "52.52", "longitude": "13.405"}]}"#,
        )])?;
        let mut store = store()?;
        let stats = import_archive(&mut store, 1, zip.path(), &ImportOptions::default())?;
        assert_eq!(stats.areas_created, 1);
        assert_eq!(store.count_rows(EntityKind::Notifications, 1)?, 1);
        Ok(())
    }

    #[test]
    fn current_archive_imports_and_notifies() -> Result<(), ImportError> {
        let zip = build_zip(&[
            (
                MANIFEST_FILE,
                r#"{"version": 2, "counts": {}, "files": {"areas": ["areas.jsonl"]}}"#,
            ),
            (
                "areas.jsonl",
                r#"{"name": "Office", "latitude": "48.85", "longitude": "2.35"}"#,
            ),
        ])?;
        let mut store = store()?;
        let stats = import_archive(&mut store, 1, zip.path(), &ImportOptions::default())?;
        assert_eq!(stats.areas_created, 1);
        assert_eq!(store.count_rows(EntityKind::Notifications, 1)?, 1);
        Ok(())
    }
}
