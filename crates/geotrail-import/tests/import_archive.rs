//! End-to-end runs against real zip archives in both layouts.

use std::io::Write;

use geotrail_core::EntityKind;
use geotrail_import::{import_archive, ImportError, ImportOptions, DOCUMENT_FILE, MANIFEST_FILE};
use geotrail_store_sqlite::Store;
use zip::write::SimpleFileOptions;

fn build_zip(entries: &[(&str, &[u8])]) -> Result<tempfile::NamedTempFile, ImportError> {
    let file = tempfile::NamedTempFile::new()?;
    let mut writer = zip::ZipWriter::new(file.reopen()?);
    for (name, body) in entries {
        writer.start_file(*name, SimpleFileOptions::default())?;
        writer.write_all(body)?;
    }
    writer.finish()?;
    Ok(file)
}

fn migrated_store() -> Result<Store, ImportError> {
    let mut store = Store::open_in_memory()?;
    store.migrate()?;
    Ok(store)
}

const LEGACY_DOCUMENT: &str = r#"{
    "counts": {"areas": 2, "points": 3},
    "settings": {"theme": "dark", "units": "metric"},
    "areas": [
        {"name": "Home", "latitude": "52.52", "longitude": "13.405", "radius": 100},
        {"name": "Office", "latitude": "52.50", "longitude": "13.39", "radius": 50}
    ],
    "imports": [
        {"name": "walk.gpx", "source": "gpx", "created_at": "2024-01-05T00:00:00Z",
         "file_name": "walk.gpx", "content_type": "application/gpx+xml"}
    ],
    "places": [
        {"name": "Cafe Luna", "latitude": 52.5, "longitude": 13.4}
    ],
    "visits": [
        {"name": "Coffee", "started_at": "2024-01-02T10:00:00Z", "ended_at": "2024-01-02T11:00:00Z",
         "place_reference": {"name": "Cafe Luna", "latitude": 52.5, "longitude": 13.4},
         "area_reference": {"name": "Home"}}
    ],
    "points": [
        {"timestamp": 1704189600, "latitude": 52.5, "longitude": 13.4,
         "visit_reference": {"name": "Coffee", "started_at": "2024-01-02T10:00:00Z",
                             "ended_at": "2024-01-02T11:00:00Z"},
         "import_reference": {"name": "walk.gpx", "source": "gpx",
                              "created_at": "2024-01-05T00:00:00Z"}},
        {"timestamp": 1704193200, "geometry": "POINT(13.41 52.51)"},
        {"latitude": 52.5, "longitude": 13.4}
    ]
}"#;

fn legacy_archive() -> Result<tempfile::NamedTempFile, ImportError> {
    build_zip(&[
        (DOCUMENT_FILE, LEGACY_DOCUMENT.as_bytes()),
        ("files/walk.gpx", b"<gpx/>"),
    ])
}

fn current_archive() -> Result<tempfile::NamedTempFile, ImportError> {
    let manifest = r#"{
        "version": 2,
        "counts": {"areas": 2, "points": 3},
        "files": {
            "settings": ["settings.jsonl"],
            "areas": ["areas.jsonl"],
            "imports": ["imports.jsonl"],
            "places": ["places.jsonl"],
            "visits": ["visits.jsonl"],
            "points": ["points/2024-01.jsonl"]
        }
    }"#;
    build_zip(&[
        (MANIFEST_FILE, manifest.as_bytes()),
        ("settings.jsonl", br#"{"theme": "dark", "units": "metric"}"#),
        (
            "areas.jsonl",
            concat!(
                r#"{"name": "Home", "latitude": "52.52", "longitude": "13.405", "radius": 100}"#,
                "\n",
                r#"{"name": "Office", "latitude": "52.50", "longitude": "13.39", "radius": 50}"#,
            )
            .as_bytes(),
        ),
        (
            "imports.jsonl",
            concat!(
                r#"{"name": "walk.gpx", "source": "gpx", "created_at": "2024-01-05T00:00:00Z", "#,
                r#""file_name": "walk.gpx", "content_type": "application/gpx+xml"}"#,
            )
            .as_bytes(),
        ),
        (
            "places.jsonl",
            br#"{"name": "Cafe Luna", "latitude": 52.5, "longitude": 13.4}"#,
        ),
        (
            "visits.jsonl",
            concat!(
                r#"{"name": "Coffee", "started_at": "2024-01-02T10:00:00Z", "#,
                r#""ended_at": "2024-01-02T11:00:00Z", "#,
                r#""place_reference": {"name": "Cafe Luna", "latitude": 52.5, "longitude": 13.4}, "#,
                r#""area_reference": {"name": "Home"}}"#,
            )
            .as_bytes(),
        ),
        (
            "points/2024-01.jsonl",
            concat!(
                r#"{"timestamp": 1704189600, "latitude": 52.5, "longitude": 13.4, "#,
                r#""visit_reference": {"name": "Coffee", "started_at": "2024-01-02T10:00:00Z", "#,
                r#""ended_at": "2024-01-02T11:00:00Z"}, "#,
                r#""import_reference": {"name": "walk.gpx", "source": "gpx", "#,
                r#""created_at": "2024-01-05T00:00:00Z"}}"#,
                "\n",
                r#"{"timestamp": 1704193200, "geometry": "POINT(13.41 52.51)"}"#,
                "\n",
                r#"{"latitude": 52.5, "longitude": 13.4}"#,
            )
            .as_bytes(),
        ),
        ("files/walk.gpx", b"<gpx/>"),
    ])
}

#[test]
fn legacy_archive_imports_everything() -> Result<(), ImportError> {
    let archive = legacy_archive()?;
    let mut store = migrated_store()?;
    let stats = import_archive(&mut store, 1, archive.path(), &ImportOptions::default())?;

    assert!(stats.settings_updated);
    assert_eq!(stats.areas_created, 2);
    assert_eq!(stats.imports_created, 1);
    assert_eq!(stats.places_created, 1);
    assert_eq!(stats.visits_created, 1);
    assert_eq!(stats.points_created, 2);
    assert_eq!(stats.points_skipped, 1);
    assert_eq!(stats.files_restored, 1);

    // The point that named references resolved them all.
    let refs = match store.point_references(1, "POINT(13.4 52.5)", 1_704_189_600)? {
        Some(refs) => refs,
        None => panic!("referencing point should exist"),
    };
    assert!(refs.0.is_some(), "import reference should resolve");
    assert!(refs.2.is_some(), "visit reference should resolve");
    Ok(())
}

#[test]
fn both_layouts_of_the_same_data_import_identically() -> Result<(), ImportError> {
    let legacy = legacy_archive()?;
    let current = current_archive()?;

    let mut legacy_store = migrated_store()?;
    let legacy_stats =
        import_archive(&mut legacy_store, 1, legacy.path(), &ImportOptions::default())?;

    let mut current_store = migrated_store()?;
    let current_stats =
        import_archive(&mut current_store, 1, current.path(), &ImportOptions::default())?;

    assert_eq!(legacy_stats, current_stats);
    for kind in EntityKind::IMPORT_ORDER {
        assert_eq!(
            legacy_store.count_rows(kind, 1)?,
            current_store.count_rows(kind, 1)?,
            "row counts diverge for {kind}",
        );
    }
    Ok(())
}

#[test]
fn reimporting_the_same_archive_creates_nothing_new() -> Result<(), ImportError> {
    let archive = current_archive()?;
    let mut store = migrated_store()?;

    let first = import_archive(&mut store, 1, archive.path(), &ImportOptions::default())?;
    assert!(first.total_created() > 0);

    let second = import_archive(&mut store, 1, archive.path(), &ImportOptions::default())?;
    assert_eq!(second.total_created(), 0);
    assert_eq!(second.points_created, 0);
    assert_eq!(second.files_restored, 0);
    // Settings merge runs again; merging identical keys changes nothing.
    assert!(second.settings_updated);

    // Each completed run records its own notification.
    assert_eq!(store.count_rows(EntityKind::Notifications, 1)?, 2);
    Ok(())
}

#[test]
fn tiny_batch_size_changes_nothing_but_flush_cadence() -> Result<(), ImportError> {
    let archive = legacy_archive()?;
    let mut store = migrated_store()?;
    let stats = import_archive(&mut store, 1, archive.path(), &ImportOptions { batch_size: 1 })?;
    assert_eq!(stats.points_created, 2);
    assert_eq!(stats.points_skipped, 1);
    assert_eq!(stats.areas_created, 2);
    Ok(())
}

#[test]
fn referenced_file_missing_from_archive_is_tolerated() -> Result<(), ImportError> {
    // Same legacy document, but the files/ entry is absent.
    let archive = build_zip(&[(DOCUMENT_FILE, LEGACY_DOCUMENT.as_bytes())])?;
    let mut store = migrated_store()?;
    let stats = import_archive(&mut store, 1, archive.path(), &ImportOptions::default())?;
    assert_eq!(stats.imports_created, 1);
    assert_eq!(stats.files_restored, 0);
    Ok(())
}

#[test]
fn users_do_not_see_each_other_after_import() -> Result<(), ImportError> {
    let mut store = migrated_store()?;
    let archive = current_archive()?;
    import_archive(&mut store, 1, archive.path(), &ImportOptions::default())?;

    assert_eq!(store.count_rows(EntityKind::Areas, 2)?, 0);
    assert_eq!(store.count_rows(EntityKind::Visits, 2)?, 0);

    // A second user importing the same archive gets their own copies.
    let stats = import_archive(&mut store, 2, archive.path(), &ImportOptions::default())?;
    assert_eq!(stats.areas_created, 2);
    assert_eq!(stats.visits_created, 1);
    // Points are deduplicated per user, not globally.
    assert_eq!(stats.points_created, 2);
    Ok(())
}
