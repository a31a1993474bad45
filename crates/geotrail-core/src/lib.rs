//! Domain vocabulary shared by the Geotrail import subsystem.
//!
//! Defines the entity kinds an archive can carry, the fixed order they must
//! import in, the untyped staging record decoded from one archive line or
//! element, the per-run statistics accumulator, and the current-format
//! archive manifest.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Manifest format version written by current exporters.
pub const MANIFEST_VERSION: u32 = 2;

/// Every entity kind an archive can carry, in no particular order.
///
/// Use [`EntityKind::IMPORT_ORDER`] when iterating for import: later kinds
/// depend on earlier kinds already existing in the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Settings,
    Areas,
    Places,
    Tags,
    Taggings,
    Imports,
    Exports,
    Trips,
    Stats,
    Digests,
    Notifications,
    Visits,
    Tracks,
    Points,
    RawDataArchives,
}

impl EntityKind {
    /// Fixed cross-kind dependency order. Visits import before tracks and
    /// points so point reference resolution can see them; file-backed kinds
    /// come after the records they may reference.
    pub const IMPORT_ORDER: [Self; 15] = [
        Self::Settings,
        Self::Areas,
        Self::Places,
        Self::Tags,
        Self::Taggings,
        Self::Imports,
        Self::Exports,
        Self::Trips,
        Self::Stats,
        Self::Digests,
        Self::Notifications,
        Self::Visits,
        Self::Tracks,
        Self::Points,
        Self::RawDataArchives,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Areas => "areas",
            Self::Places => "places",
            Self::Tags => "tags",
            Self::Taggings => "taggings",
            Self::Imports => "imports",
            Self::Exports => "exports",
            Self::Trips => "trips",
            Self::Stats => "stats",
            Self::Digests => "digests",
            Self::Notifications => "notifications",
            Self::Visits => "visits",
            Self::Tracks => "tracks",
            Self::Points => "points",
            Self::RawDataArchives => "raw_data_archives",
        }
    }

    /// Parse a top-level section or manifest key.
    #[must_use]
    pub fn from_section(name: &str) -> Option<Self> {
        Self::IMPORT_ORDER.iter().copied().find(|kind| kind.as_str() == name)
    }

    /// Whether the current format partitions this kind into monthly shards.
    #[must_use]
    pub fn sharded(self) -> bool {
        matches!(
            self,
            Self::Points | Self::Visits | Self::Stats | Self::Tracks | Self::Digests
        )
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Export bookkeeping fields stripped from every record before it is stored.
pub const BOOKKEEPING_FIELDS: [&str; 3] = ["id", "user_id", "updated_at"];

/// One untyped record decoded from an archive line or streamed element.
///
/// Lives only while its batch is being processed; accessors tolerate missing
/// or mistyped fields by returning `None` so callers can skip, not crash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Map<String, Value>);

impl RawRecord {
    /// Decode a record from an arbitrary JSON value; non-objects yield `None`.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Numeric field, accepting either a JSON number or a numeric string.
    #[must_use]
    pub fn f64_field(&self, name: &str) -> Option<f64> {
        match self.0.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer field, accepting either a JSON number or a numeric string.
    #[must_use]
    pub fn i64_field(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String form of a key field: strings pass through, numbers and
    /// booleans are rendered, everything else is absent.
    #[must_use]
    pub fn key_field(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Remove and return an embedded reference payload.
    pub fn take_reference(&mut self, name: &str) -> Option<Self> {
        match self.0.remove(name)? {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Remove and return an embedded array field.
    pub fn take_array(&mut self, name: &str) -> Option<Vec<Value>> {
        match self.0.remove(name)? {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Drop export bookkeeping fields that must not cross databases.
    pub fn strip_bookkeeping(&mut self) {
        for field in BOOKKEEPING_FIELDS {
            self.0.remove(field);
        }
    }

    /// Serialize the remaining fields as the stored payload document.
    #[must_use]
    pub fn payload_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

/// Synthesize the canonical geometry string for a coordinate pair.
#[must_use]
pub fn wkt_point(longitude: f64, latitude: f64) -> String {
    format!("POINT({longitude} {latitude})")
}

/// Mutable per-run accumulator returned to the caller when a run succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub settings_updated: bool,
    pub areas_created: u64,
    pub places_created: u64,
    pub tags_created: u64,
    pub taggings_created: u64,
    pub imports_created: u64,
    pub exports_created: u64,
    pub trips_created: u64,
    pub stats_created: u64,
    pub digests_created: u64,
    pub notifications_created: u64,
    pub visits_created: u64,
    pub tracks_created: u64,
    pub points_created: u64,
    pub points_skipped: u64,
    pub raw_data_archives_created: u64,
    pub files_restored: u64,
}

impl ImportStats {
    /// Add to the created tally for one kind. Settings records toggle the
    /// updated flag instead of counting.
    pub fn add_created(&mut self, kind: EntityKind, count: u64) {
        if let Some(slot) = self.created_slot(kind) {
            *slot += count;
        } else {
            self.settings_updated |= count > 0;
        }
    }

    /// Read the created tally for one kind.
    #[must_use]
    pub fn created(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::Settings => u64::from(self.settings_updated),
            EntityKind::Areas => self.areas_created,
            EntityKind::Places => self.places_created,
            EntityKind::Tags => self.tags_created,
            EntityKind::Taggings => self.taggings_created,
            EntityKind::Imports => self.imports_created,
            EntityKind::Exports => self.exports_created,
            EntityKind::Trips => self.trips_created,
            EntityKind::Stats => self.stats_created,
            EntityKind::Digests => self.digests_created,
            EntityKind::Notifications => self.notifications_created,
            EntityKind::Visits => self.visits_created,
            EntityKind::Tracks => self.tracks_created,
            EntityKind::Points => self.points_created,
            EntityKind::RawDataArchives => self.raw_data_archives_created,
        }
    }

    fn created_slot(&mut self, kind: EntityKind) -> Option<&mut u64> {
        match kind {
            // Settings has no created count; it flips `settings_updated`.
            EntityKind::Settings => None,
            EntityKind::Areas => Some(&mut self.areas_created),
            EntityKind::Places => Some(&mut self.places_created),
            EntityKind::Tags => Some(&mut self.tags_created),
            EntityKind::Taggings => Some(&mut self.taggings_created),
            EntityKind::Imports => Some(&mut self.imports_created),
            EntityKind::Exports => Some(&mut self.exports_created),
            EntityKind::Trips => Some(&mut self.trips_created),
            EntityKind::Stats => Some(&mut self.stats_created),
            EntityKind::Digests => Some(&mut self.digests_created),
            EntityKind::Notifications => Some(&mut self.notifications_created),
            EntityKind::Visits => Some(&mut self.visits_created),
            EntityKind::Tracks => Some(&mut self.tracks_created),
            EntityKind::Points => Some(&mut self.points_created),
            EntityKind::RawDataArchives => Some(&mut self.raw_data_archives_created),
        }
    }

    /// Total records created across every kind.
    #[must_use]
    pub fn total_created(&self) -> u64 {
        EntityKind::IMPORT_ORDER
            .iter()
            .filter(|kind| **kind != EntityKind::Settings)
            .map(|kind| self.created(*kind))
            .sum()
    }
}

/// Current-format index file describing the archive layout.
///
/// Parsed once at run start; counts are diagnostic, file lists drive the
/// handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub version: u32,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub files: BTreeMap<String, Vec<String>>,
}

impl ArchiveManifest {
    /// Relative paths for one kind, in manifest order.
    #[must_use]
    pub fn files_for(&self, kind: EntityKind) -> &[String] {
        self.files.get(kind.as_str()).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_order_covers_every_kind_once() {
        let mut seen = std::collections::BTreeSet::new();
        for kind in EntityKind::IMPORT_ORDER {
            assert!(seen.insert(kind.as_str()), "duplicate kind {kind}");
        }
        assert_eq!(seen.len(), 15);
    }

    #[test]
    fn section_names_round_trip() {
        for kind in EntityKind::IMPORT_ORDER {
            assert_eq!(EntityKind::from_section(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::from_section("bogus"), None);
    }

    #[test]
    fn dependency_order_puts_places_before_visits_before_points() {
        let order = EntityKind::IMPORT_ORDER;
        let position = |kind| order.iter().position(|k| *k == kind);
        assert!(position(EntityKind::Places) < position(EntityKind::Visits));
        assert!(position(EntityKind::Visits) < position(EntityKind::Points));
        assert!(position(EntityKind::Imports) < position(EntityKind::Points));
    }

    #[test]
    fn raw_record_accessors_tolerate_mistyped_fields() {
        let value = serde_json::json!({
            "name": "Home",
            "latitude": "52.52",
            "timestamp": 1_700_000_000,
            "flag": true,
            "nested": {"a": 1}
        });
        let record = RawRecord::from_value(value).map_or_else(
            || panic!("object should decode"),
            |record| record,
        );
        assert_eq!(record.str_field("name"), Some("Home"));
        assert_eq!(record.f64_field("latitude"), Some(52.52));
        assert_eq!(record.i64_field("timestamp"), Some(1_700_000_000));
        assert_eq!(record.key_field("flag").as_deref(), Some("true"));
        assert_eq!(record.str_field("nested"), None);
        assert_eq!(record.f64_field("name"), None);
    }

    #[test]
    fn strip_bookkeeping_removes_transferred_identifiers() {
        let value = serde_json::json!({"id": 7, "user_id": 3, "updated_at": "x", "name": "keep"});
        let mut record = match RawRecord::from_value(value) {
            Some(record) => record,
            None => panic!("object should decode"),
        };
        record.strip_bookkeeping();
        assert_eq!(record.0.len(), 1);
        assert_eq!(record.str_field("name"), Some("keep"));
    }

    #[test]
    fn stats_tallies_by_kind() {
        let mut stats = ImportStats::default();
        stats.add_created(EntityKind::Areas, 2);
        stats.add_created(EntityKind::Points, 5);
        stats.add_created(EntityKind::Settings, 1);
        assert_eq!(stats.areas_created, 2);
        assert_eq!(stats.created(EntityKind::Points), 5);
        assert!(stats.settings_updated);
        assert_eq!(stats.total_created(), 7);
    }

    #[test]
    fn manifest_lists_files_per_kind() {
        let manifest: ArchiveManifest = serde_json::from_value(serde_json::json!({
            "version": 2,
            "counts": {"points": 3},
            "files": {"points": ["points/2024-01.jsonl", "points/2024-02.jsonl"]}
        }))
        .map_or_else(|err| panic!("manifest should decode: {err}"), |m| m);
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.files_for(EntityKind::Points).len(), 2);
        assert!(manifest.files_for(EntityKind::Areas).is_empty());
    }

    #[test]
    fn wkt_point_formats_lon_lat() {
        assert_eq!(wkt_point(13.4, 52.5), "POINT(13.4 52.5)");
    }
}
