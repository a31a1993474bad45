//! Current sharded-manifest format handler.
//!
//! The manifest maps each entity kind to its line-delimited data files, one
//! record per line, with high-volume kinds split into monthly shards. Files
//! are processed kind by kind in dependency order, so every reference a
//! later kind carries can already be resolved. A malformed line loses that
//! record only; the run keeps going.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Component, Path, PathBuf};

use geotrail_core::{ArchiveManifest, EntityKind, ImportStats, RawRecord, MANIFEST_VERSION};
use geotrail_store_sqlite::Store;
use serde_json::Value;

use crate::entities;
use crate::lookup::ReferenceCache;
use crate::points::PointImporter;
use crate::tracker::RunTracker;
use crate::{ImportError, FILES_DIR, MANIFEST_FILE};

/// Run a current-format import from an extracted archive root.
///
/// # Errors
/// Returns an error for a missing or unreadable manifest, an unsupported
/// manifest version, or a storage failure that escalates past a single
/// record.
pub fn run(
    store: &mut Store,
    user_id: i64,
    root: &Path,
    batch_size: usize,
    tracker: &RunTracker,
) -> Result<ImportStats, ImportError> {
    let manifest = read_manifest(root)?;
    if manifest.version != MANIFEST_VERSION {
        return Err(ImportError::UnsupportedManifestVersion(manifest.version));
    }
    let files_dir = root.join(FILES_DIR);
    let mut stats = ImportStats::default();

    for kind in EntityKind::IMPORT_ORDER {
        let files = manifest.files_for(kind);
        if files.is_empty() {
            continue;
        }
        if kind == EntityKind::Points {
            import_point_files(store, user_id, root, files, batch_size, &mut stats)?;
        } else {
            for file in files {
                let path = entry_path(root, file)?;
                read_batches(&path, batch_size, |batch| {
                    entities::import_batch(store, user_id, kind, &batch, &files_dir, &mut stats)
                })?;
            }
        }
        tracker.checkpoint(kind.as_str());
    }
    Ok(stats)
}

fn read_manifest(root: &Path) -> Result<ArchiveManifest, ImportError> {
    let file = File::open(root.join(MANIFEST_FILE))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|err| ImportError::MalformedDocument(format!("manifest: {err}")))
}

/// One importer spans every point shard, so the flush cadence is independent
/// of how the exporter sliced the months.
fn import_point_files(
    store: &mut Store,
    user_id: i64,
    root: &Path,
    files: &[String],
    batch_size: usize,
    stats: &mut ImportStats,
) -> Result<(), ImportError> {
    let cache = ReferenceCache::load(store, user_id)?;
    let mut importer = PointImporter::new(store, user_id, &cache, batch_size);
    for file in files {
        let path = entry_path(root, file)?;
        read_records(&path, |record| importer.push(record))?;
    }
    let outcome = importer.finalize()?;
    stats.points_created += outcome.created;
    stats.points_skipped += outcome.skipped;
    Ok(())
}

/// Resolve a manifest-relative entry, refusing paths that climb out of the
/// extracted archive.
fn entry_path(root: &Path, entry: &str) -> Result<PathBuf, ImportError> {
    let relative = Path::new(entry);
    let escapes = relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    if escapes || relative.as_os_str().is_empty() {
        return Err(ImportError::MalformedDocument(format!(
            "manifest entry `{entry}` escapes the archive"
        )));
    }
    Ok(root.join(relative))
}

fn read_records(
    path: &Path,
    mut handle: impl FnMut(RawRecord) -> Result<(), ImportError>,
) -> Result<(), ImportError> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<Value>(&line)
            .ok()
            .and_then(RawRecord::from_value);
        match record {
            Some(record) => handle(record)?,
            None => tracing::warn!(path = %path.display(), "skipping malformed line"),
        }
    }
    Ok(())
}

fn read_batches(
    path: &Path,
    batch_size: usize,
    mut handle: impl FnMut(Vec<RawRecord>) -> Result<(), ImportError>,
) -> Result<(), ImportError> {
    let mut batch = Vec::new();
    read_records(path, |record| {
        batch.push(record);
        if batch.len() >= batch_size {
            handle(std::mem::take(&mut batch))?;
        }
        Ok(())
    })?;
    if !batch.is_empty() {
        handle(batch)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(path: &Path, lines: &[&str]) -> Result<(), ImportError> {
        let mut file = File::create(path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    fn run_root(root: &Path) -> Result<(Store, ImportStats), ImportError> {
        let mut store = Store::open_in_memory()?;
        store.migrate()?;
        let tracker = RunTracker::new("test");
        let stats = run(&mut store, 1, root, 5000, &tracker)?;
        Ok((store, stats))
    }

    #[test]
    fn imports_sharded_points_through_one_importer() -> Result<(), ImportError> {
        let root = tempfile::tempdir()?;
        std::fs::create_dir(root.path().join("points"))?;
        write_lines(
            &root.path().join("points/2024-01.jsonl"),
            &[r#"{"timestamp": 1, "latitude": 1.0, "longitude": 2.0}"#],
        )?;
        write_lines(
            &root.path().join("points/2024-02.jsonl"),
            &[
                r#"{"timestamp": 2, "latitude": 1.0, "longitude": 2.0}"#,
                "not json at all",
                r#"{"timestamp": 3, "geometry": "POINT(2.0 1.0)"}"#,
            ],
        )?;
        std::fs::write(
            root.path().join(MANIFEST_FILE),
            r#"{
                "version": 2,
                "counts": {"points": 3},
                "files": {"points": ["points/2024-01.jsonl", "points/2024-02.jsonl"]}
            }"#,
        )?;
        let (_, stats) = run_root(root.path())?;
        assert_eq!(stats.points_created, 3);
        assert_eq!(stats.points_skipped, 0);
        Ok(())
    }

    #[test]
    fn dependency_order_beats_manifest_order() -> Result<(), ImportError> {
        // Points listed before the visit they reference; the kind loop must
        // still import visits first.
        let root = tempfile::tempdir()?;
        write_lines(
            &root.path().join("visits.jsonl"),
            &[r#"{"name": "Walk", "started_at": "2024-03-01T08:00:00Z", "ended_at": "2024-03-01T09:00:00Z"}"#],
        )?;
        write_lines(
            &root.path().join("points.jsonl"),
            &[r#"{"timestamp": 9, "geometry": "POINT(3.0 4.0)", "visit_reference": {"name": "Walk", "started_at": "2024-03-01T08:00:00Z", "ended_at": "2024-03-01T09:00:00Z"}}"#],
        )?;
        std::fs::write(
            root.path().join(MANIFEST_FILE),
            r#"{
                "version": 2,
                "counts": {},
                "files": {"points": ["points.jsonl"], "visits": ["visits.jsonl"]}
            }"#,
        )?;
        let (store, stats) = run_root(root.path())?;
        assert_eq!(stats.visits_created, 1);
        assert_eq!(stats.points_created, 1);
        let refs = match store.point_references(1, "POINT(3.0 4.0)", 9)? {
            Some(refs) => refs,
            None => panic!("point should exist"),
        };
        assert!(refs.2.is_some());
        Ok(())
    }

    #[test]
    fn unsupported_manifest_version_is_fatal() -> Result<(), ImportError> {
        let root = tempfile::tempdir()?;
        std::fs::write(
            root.path().join(MANIFEST_FILE),
            r#"{"version": 7, "counts": {}, "files": {}}"#,
        )?;
        let result = run_root(root.path());
        assert!(matches!(result, Err(ImportError::UnsupportedManifestVersion(7))));
        Ok(())
    }

    #[test]
    fn escaping_manifest_entry_is_rejected() -> Result<(), ImportError> {
        let root = tempfile::tempdir()?;
        std::fs::write(
            root.path().join(MANIFEST_FILE),
            r#"{"version": 2, "counts": {}, "files": {"areas": ["../outside.jsonl"]}}"#,
        )?;
        let result = run_root(root.path());
        assert!(matches!(result, Err(ImportError::MalformedDocument(_))));
        Ok(())
    }

    #[test]
    fn listed_file_that_is_missing_is_an_io_error() -> Result<(), ImportError> {
        let root = tempfile::tempdir()?;
        std::fs::write(
            root.path().join(MANIFEST_FILE),
            r#"{"version": 2, "counts": {}, "files": {"areas": ["areas.jsonl"]}}"#,
        )?;
        let result = run_root(root.path());
        assert!(matches!(result, Err(ImportError::Io(_))));
        Ok(())
    }
}
