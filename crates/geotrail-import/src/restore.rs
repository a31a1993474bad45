//! Re-attaches binary payloads to newly created records.

use std::path::Path;

use geotrail_core::{EntityKind, RawRecord};
use geotrail_store_sqlite::Store;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Attach the file named by `record` from the extracted files directory.
///
/// Returns whether a file was attached. Every failure mode here is
/// best-effort: a record without a file reference, a missing or unreadable
/// file, or a failed attachment write all log and return `false` — the
/// owning record still counts as created.
pub fn restore_attachment(
    store: &Store,
    owner_kind: EntityKind,
    owner_id: i64,
    record: &RawRecord,
    files_dir: &Path,
) -> bool {
    let Some(file_name) = record.str_field("file_name") else {
        return false;
    };
    if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
        tracing::warn!(kind = %owner_kind, owner_id, file_name, "rejecting unsafe attachment name");
        return false;
    }

    let path = files_dir.join(file_name);
    if !path.is_file() {
        tracing::warn!(kind = %owner_kind, owner_id, file_name, "attachment file missing, skipping");
        return false;
    }

    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(kind = %owner_kind, owner_id, file_name, %err, "failed to read attachment");
            return false;
        }
    };

    let content_type = record.str_field("content_type").unwrap_or(DEFAULT_CONTENT_TYPE);
    match store.insert_attachment(owner_kind, owner_id, file_name, content_type, &data) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(kind = %owner_kind, owner_id, file_name, %err, "failed to attach file");
            false
        }
    }
}
