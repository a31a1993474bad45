//! Per-entity importers: match on natural key, skip existing, create missing.
//!
//! One bad record never aborts its batch or the run — validation and insert
//! failures are logged and skipped. Points are the exception to everything
//! here and live in [`crate::points`].

use std::path::Path;

use geotrail_core::{EntityKind, ImportStats, RawRecord};
use geotrail_store_sqlite::{generic_spec, EntitySpec, Store};

use crate::restore::restore_attachment;
use crate::ImportError;

/// Route one decoded batch to the importer for its kind.
///
/// `files_dir` is the extracted files directory, used by the kinds that
/// carry binary payloads.
///
/// # Errors
/// Returns an error only for store-level failures that escalate past a
/// single record (settings write, structural queries).
pub fn import_batch(
    store: &Store,
    user_id: i64,
    kind: EntityKind,
    records: &[RawRecord],
    files_dir: &Path,
    stats: &mut ImportStats,
) -> Result<(), ImportError> {
    match kind {
        EntityKind::Settings => import_settings(store, user_id, records, stats),
        EntityKind::Places => {
            import_places(store, records, stats);
            Ok(())
        }
        EntityKind::Visits => import_visits(store, user_id, records, stats),
        EntityKind::Tracks => import_tracks(store, user_id, records, stats),
        EntityKind::Imports | EntityKind::Exports | EntityKind::RawDataArchives => {
            match generic_spec(kind) {
                Some(spec) => {
                    import_with_files(store, user_id, spec, records, files_dir, stats);
                    Ok(())
                }
                None => Ok(()),
            }
        }
        // Points go through the buffered PointImporter, never through here.
        EntityKind::Points => Ok(()),
        _ => match generic_spec(kind) {
            Some(spec) => {
                import_generic(store, user_id, spec, records, stats);
                Ok(())
            }
            None => Ok(()),
        },
    }
}

/// Key values for a record under a generic spec, in column order.
#[must_use]
pub fn natural_key(spec: &EntitySpec, record: &RawRecord) -> Option<Vec<String>> {
    spec.key_columns.iter().map(|field| record.key_field(field)).collect()
}

/// Generic match-or-create importer for kinds without special behavior.
pub fn import_generic(
    store: &Store,
    user_id: i64,
    spec: &EntitySpec,
    records: &[RawRecord],
    stats: &mut ImportStats,
) {
    for record in records {
        create_generic(store, user_id, spec, record, stats);
    }
}

/// Generic importer for the kinds that own binary payloads; restores the
/// named file for each newly created record.
pub fn import_with_files(
    store: &Store,
    user_id: i64,
    spec: &EntitySpec,
    records: &[RawRecord],
    files_dir: &Path,
    stats: &mut ImportStats,
) {
    for record in records {
        if let Some(owner_id) = create_generic(store, user_id, spec, record, stats) {
            if restore_attachment(store, spec.kind, owner_id, record, files_dir) {
                stats.files_restored += 1;
            }
        }
    }
}

fn create_generic(
    store: &Store,
    user_id: i64,
    spec: &EntitySpec,
    record: &RawRecord,
    stats: &mut ImportStats,
) -> Option<i64> {
    let kind = spec.kind;
    let Some(key) = natural_key(spec, record) else {
        tracing::warn!(%kind, "record is missing natural key fields, skipping");
        return None;
    };
    match store.find_by_key(spec, user_id, &key) {
        Ok(Some(_)) => {
            tracing::debug!(%kind, ?key, "record already exists, skipping");
            None
        }
        Ok(None) => {
            let mut stripped = record.clone();
            stripped.strip_bookkeeping();
            match store.insert_record(spec, user_id, &key, &stripped.payload_json()) {
                Ok(id) => {
                    stats.add_created(kind, 1);
                    Some(id)
                }
                Err(err) => {
                    tracing::warn!(%kind, ?key, %err, "failed to create record, skipping");
                    None
                }
            }
        }
        Err(err) => {
            tracing::warn!(%kind, ?key, %err, "natural key lookup failed, skipping");
            None
        }
    }
}

/// Shallow top-level merge of the archived settings document into the
/// user's current one. Archived keys overwrite; unmentioned keys survive.
///
/// # Errors
/// Returns an error when the settings read or write fails; there is exactly
/// one settings document per user, so this is not a per-record skip.
pub fn import_settings(
    store: &Store,
    user_id: i64,
    records: &[RawRecord],
    stats: &mut ImportStats,
) -> Result<(), ImportError> {
    let Some(archived) = records.first() else {
        return Ok(());
    };
    let mut archived = archived.clone();
    archived.strip_bookkeeping();
    let mut current = store.get_settings(user_id)?.unwrap_or_default();
    for (key, value) in archived.0 {
        current.insert(key, value);
    }
    store.put_settings(user_id, &current)?;
    stats.settings_updated = true;
    Ok(())
}

/// Places are global: matched by exact (name, latitude, longitude), created
/// if absent, never touched otherwise.
pub fn import_places(store: &Store, records: &[RawRecord], stats: &mut ImportStats) {
    for record in records {
        let (Some(name), Some(latitude), Some(longitude)) = (
            record.str_field("name").map(str::to_string),
            record.f64_field("latitude"),
            record.f64_field("longitude"),
        ) else {
            tracing::warn!("place record is missing name or coordinates, skipping");
            continue;
        };
        match store.find_place(&name, latitude, longitude) {
            Ok(Some(_)) => {
                tracing::debug!(name, "place already exists, skipping");
            }
            Ok(None) => {
                let mut stripped = record.clone();
                stripped.strip_bookkeeping();
                let source = record.str_field("source").unwrap_or("import");
                match store.create_place(&name, latitude, longitude, source, &stripped.payload_json())
                {
                    Ok(_) => stats.places_created += 1,
                    Err(err) => tracing::warn!(name, %err, "failed to create place, skipping"),
                }
            }
            Err(err) => tracing::warn!(name, %err, "place lookup failed, skipping"),
        }
    }
}

/// Visits match on (name, started_at, ended_at) and may link a place and an
/// area. A place reference that matches nothing creates the place on the
/// fly with `source = "manual"`.
///
/// # Errors
/// This importer skips per-record failures; the `Result` covers nothing
/// today but keeps the signature uniform with the other fallible importers.
pub fn import_visits(
    store: &Store,
    user_id: i64,
    records: &[RawRecord],
    stats: &mut ImportStats,
) -> Result<(), ImportError> {
    for record in records {
        let (Some(name), Some(started_at), Some(ended_at)) = (
            record.key_field("name"),
            record.key_field("started_at"),
            record.key_field("ended_at"),
        ) else {
            tracing::warn!("visit record is missing its natural key, skipping");
            continue;
        };
        match store.find_visit(user_id, &name, &started_at, &ended_at) {
            Ok(Some(_)) => {
                tracing::debug!(name, "visit already exists, skipping");
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(name, %err, "visit lookup failed, skipping");
                continue;
            }
        }

        let mut stripped = record.clone();
        stripped.strip_bookkeeping();
        let place_id = stripped
            .take_reference("place_reference")
            .and_then(|reference| resolve_or_create_place(store, &reference, stats));
        let area_id = stripped
            .take_reference("area_reference")
            .and_then(|reference| reference.key_field("name"))
            .and_then(|area_name| {
                store.find_area_by_name(user_id, &area_name).ok().flatten()
            });

        match store.create_visit(
            user_id,
            &name,
            &started_at,
            &ended_at,
            place_id,
            area_id,
            &stripped.payload_json(),
        ) {
            Ok(_) => stats.visits_created += 1,
            Err(err) => tracing::warn!(name, %err, "failed to create visit, skipping"),
        }
    }
    Ok(())
}

fn resolve_or_create_place(
    store: &Store,
    reference: &RawRecord,
    stats: &mut ImportStats,
) -> Option<i64> {
    let name = reference.str_field("name")?.to_string();
    let latitude = reference.f64_field("latitude")?;
    let longitude = reference.f64_field("longitude")?;
    match store.find_place(&name, latitude, longitude) {
        Ok(Some(id)) => Some(id),
        Ok(None) => match store.create_place(&name, latitude, longitude, "manual", "{}") {
            Ok(id) => {
                stats.places_created += 1;
                Some(id)
            }
            Err(err) => {
                tracing::warn!(name, %err, "failed to create referenced place");
                None
            }
        },
        Err(err) => {
            tracing::warn!(name, %err, "referenced place lookup failed");
            None
        }
    }
}

/// Tracks match on (started_at, ended_at); the record's `segments` array
/// becomes ordered track_segments rows created immediately after the track.
///
/// # Errors
/// This importer skips per-record failures; see [`import_visits`] on the
/// signature.
pub fn import_tracks(
    store: &Store,
    user_id: i64,
    records: &[RawRecord],
    stats: &mut ImportStats,
) -> Result<(), ImportError> {
    for record in records {
        let (Some(started_at), Some(ended_at)) =
            (record.key_field("started_at"), record.key_field("ended_at"))
        else {
            tracing::warn!("track record is missing its natural key, skipping");
            continue;
        };
        match store.find_track(user_id, &started_at, &ended_at) {
            Ok(Some(_)) => {
                tracing::debug!(started_at, "track already exists, skipping");
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(started_at, %err, "track lookup failed, skipping");
                continue;
            }
        }

        let mut stripped = record.clone();
        stripped.strip_bookkeeping();
        let segments = stripped.take_array("segments").unwrap_or_default();
        let track_id = match store.create_track(
            user_id,
            &started_at,
            &ended_at,
            &stripped.payload_json(),
        ) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(started_at, %err, "failed to create track, skipping");
                continue;
            }
        };
        for (position, segment) in segments.iter().enumerate() {
            let position = position as i64;
            if let Err(err) =
                store.create_track_segment(track_id, position, &segment.to_string())
            {
                tracing::warn!(track_id, position, %err, "failed to create track segment");
            }
        }
        stats.tracks_created += 1;
    }
    Ok(())
}
