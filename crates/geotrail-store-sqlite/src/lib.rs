//! SQLite storage engine boundary for the Geotrail import subsystem.
//!
//! Owns the schema, natural-key lookups, and the bulk conflict-skipping
//! point write. Importers never pre-check point uniqueness; the unique index
//! on (user, geometry, timestamp, device) is the deduplicator and
//! `sqlite3_changes` after each bulk statement is the actually-inserted
//! count.

use std::path::Path;

use geotrail_core::EntityKind;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Schema version this build migrates to.
pub const LATEST_SCHEMA_VERSION: i64 = 1;

/// Rows per multi-row INSERT statement. Keeps the bound-parameter count
/// well under the SQLite variable limit at nine parameters per row.
const POINT_INSERT_CHUNK: usize = 500;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS settings (
  user_id INTEGER PRIMARY KEY,
  data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS areas (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  latitude TEXT NOT NULL,
  longitude TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, name, latitude, longitude)
);

CREATE TABLE IF NOT EXISTS places (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  latitude REAL NOT NULL,
  longitude REAL NOT NULL,
  source TEXT NOT NULL DEFAULT 'import',
  payload TEXT NOT NULL DEFAULT '{}',
  UNIQUE(name, latitude, longitude)
);

CREATE TABLE IF NOT EXISTS tags (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS taggings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  tag_name TEXT NOT NULL,
  taggable_type TEXT NOT NULL,
  taggable_key TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, tag_name, taggable_type, taggable_key)
);

CREATE TABLE IF NOT EXISTS imports (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  source TEXT NOT NULL,
  created_at TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, name, source, created_at)
);

CREATE TABLE IF NOT EXISTS exports (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, name, created_at)
);

CREATE TABLE IF NOT EXISTS trips (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, name, started_at, ended_at)
);

CREATE TABLE IF NOT EXISTS stats (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  year TEXT NOT NULL,
  month TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, year, month)
);

CREATE TABLE IF NOT EXISTS digests (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  year TEXT NOT NULL,
  month TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, year, month)
);

CREATE TABLE IF NOT EXISTS notifications (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  title TEXT NOT NULL,
  created_at TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, title, created_at)
);

CREATE TABLE IF NOT EXISTS visits (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  place_id INTEGER REFERENCES places(id),
  area_id INTEGER REFERENCES areas(id),
  payload TEXT NOT NULL,
  UNIQUE(user_id, name, started_at, ended_at)
);

CREATE TABLE IF NOT EXISTS tracks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, started_at, ended_at)
);

CREATE TABLE IF NOT EXISTS track_segments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  track_id INTEGER NOT NULL REFERENCES tracks(id),
  position INTEGER NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(track_id, position)
);

CREATE TABLE IF NOT EXISTS countries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  iso_a2 TEXT NOT NULL,
  iso_a3 TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS points (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  geometry TEXT NOT NULL,
  timestamp INTEGER NOT NULL,
  device_id TEXT NOT NULL DEFAULT '',
  import_id INTEGER REFERENCES imports(id),
  country_id INTEGER REFERENCES countries(id),
  visit_id INTEGER REFERENCES visits(id),
  track_id INTEGER REFERENCES tracks(id),
  payload TEXT NOT NULL,
  UNIQUE(user_id, geometry, timestamp, device_id)
);

CREATE TABLE IF NOT EXISTS raw_data_archives (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  file_name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  payload TEXT NOT NULL,
  UNIQUE(user_id, file_name, created_at)
);

CREATE TABLE IF NOT EXISTS attachments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner_kind TEXT NOT NULL,
  owner_id INTEGER NOT NULL,
  filename TEXT NOT NULL,
  content_type TEXT NOT NULL,
  data BLOB NOT NULL,
  UNIQUE(owner_kind, owner_id, filename)
);

CREATE INDEX IF NOT EXISTS idx_points_user_timestamp ON points(user_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_visits_user ON visits(user_id);
CREATE INDEX IF NOT EXISTS idx_imports_user ON imports(user_id);
";

/// Store-level error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("migration failed: {0}")]
    Migration(String),
}

type Result<T> = std::result::Result<T, StoreError>;

/// Static description of a kind handled by the generic natural-key path.
///
/// `key_columns` are both the record field names and the table column
/// names; the schema keeps them identical on purpose.
#[derive(Debug, Clone, Copy)]
pub struct EntitySpec {
    pub kind: EntityKind,
    pub table: &'static str,
    pub key_columns: &'static [&'static str],
    pub user_scoped: bool,
}

/// Kinds whose match-or-create needs nothing beyond key columns + payload.
pub const GENERIC_SPECS: [EntitySpec; 10] = [
    EntitySpec {
        kind: EntityKind::Areas,
        table: "areas",
        key_columns: &["name", "latitude", "longitude"],
        user_scoped: true,
    },
    EntitySpec { kind: EntityKind::Tags, table: "tags", key_columns: &["name"], user_scoped: false },
    EntitySpec {
        kind: EntityKind::Taggings,
        table: "taggings",
        key_columns: &["tag_name", "taggable_type", "taggable_key"],
        user_scoped: true,
    },
    EntitySpec {
        kind: EntityKind::Imports,
        table: "imports",
        key_columns: &["name", "source", "created_at"],
        user_scoped: true,
    },
    EntitySpec {
        kind: EntityKind::Exports,
        table: "exports",
        key_columns: &["name", "created_at"],
        user_scoped: true,
    },
    EntitySpec {
        kind: EntityKind::Trips,
        table: "trips",
        key_columns: &["name", "started_at", "ended_at"],
        user_scoped: true,
    },
    EntitySpec {
        kind: EntityKind::Stats,
        table: "stats",
        key_columns: &["year", "month"],
        user_scoped: true,
    },
    EntitySpec {
        kind: EntityKind::Digests,
        table: "digests",
        key_columns: &["year", "month"],
        user_scoped: true,
    },
    EntitySpec {
        kind: EntityKind::Notifications,
        table: "notifications",
        key_columns: &["title", "created_at"],
        user_scoped: true,
    },
    EntitySpec {
        kind: EntityKind::RawDataArchives,
        table: "raw_data_archives",
        key_columns: &["file_name", "created_at"],
        user_scoped: true,
    },
];

/// Look up the generic spec for a kind, if it has one.
#[must_use]
pub fn generic_spec(kind: EntityKind) -> Option<&'static EntitySpec> {
    GENERIC_SPECS.iter().find(|spec| spec.kind == kind)
}

/// One point row, normalized to the full column set before the bulk write.
///
/// Every field is present on every row so a short record can never bleed
/// stale column values into a sibling row of the same statement.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRow {
    pub geometry: String,
    pub timestamp: i64,
    pub device_id: String,
    pub import_id: Option<i64>,
    pub country_id: Option<i64>,
    pub visit_id: Option<i64>,
    pub track_id: Option<i64>,
    pub payload: String,
}

/// A country reference-data row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryRow {
    pub id: i64,
    pub name: String,
    pub iso_a2: String,
    pub iso_a3: String,
}

/// A stored import record key, as loaded for reference resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    pub id: i64,
    pub name: String,
    pub source: String,
    pub created_at: String,
}

/// A stored visit key, as loaded for reference resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitRow {
    pub id: i64,
    pub name: String,
    pub started_at: String,
    pub ended_at: String,
}

/// SQLite-backed store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory store, used by tests.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self { conn })
    }

    /// Apply pending schema migrations.
    ///
    /// # Errors
    /// Returns an error when a migration statement fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let current = self.schema_version()?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(StoreError::Migration(format!(
                "database schema version {current} is newer than supported {LATEST_SCHEMA_VERSION}"
            )));
        }
        if current < 1 {
            let tx = self.conn.transaction()?;
            tx.execute_batch(MIGRATION_001_SQL)?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    /// Current schema version, 0 when no migration has run.
    ///
    /// # Errors
    /// Returns an error when the version query fails.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
        Ok(version.unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Generic natural-key path
    // ------------------------------------------------------------------

    /// Find an existing record id by natural key.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_by_key(
        &self,
        spec: &EntitySpec,
        user_id: i64,
        key: &[String],
    ) -> Result<Option<i64>> {
        let mut clauses: Vec<String> =
            spec.key_columns.iter().map(|col| format!("{col} = ?")).collect();
        if spec.user_scoped {
            clauses.push("user_id = ?".to_string());
        }
        let sql = format!("SELECT id FROM {} WHERE {}", spec.table, clauses.join(" AND "));

        let mut bound: Vec<SqlValue> =
            key.iter().map(|value| SqlValue::Text(value.clone())).collect();
        if spec.user_scoped {
            bound.push(SqlValue::Integer(user_id));
        }

        let id = self
            .conn
            .query_row(&sql, rusqlite::params_from_iter(bound), |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    /// Insert a record with its key columns and payload; returns the new id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_record(
        &self,
        spec: &EntitySpec,
        user_id: i64,
        key: &[String],
        payload: &str,
    ) -> Result<i64> {
        let mut columns: Vec<&str> = spec.key_columns.to_vec();
        if spec.user_scoped {
            columns.push("user_id");
        }
        columns.push("payload");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            spec.table,
            columns.join(", "),
            placeholders
        );

        let mut bound: Vec<SqlValue> =
            key.iter().map(|value| SqlValue::Text(value.clone())).collect();
        if spec.user_scoped {
            bound.push(SqlValue::Integer(user_id));
        }
        bound.push(SqlValue::Text(payload.to_string()));

        self.conn.execute(&sql, rusqlite::params_from_iter(bound))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Count stored rows for a kind, scoped to a user where applicable.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_rows(&self, kind: EntityKind, user_id: i64) -> Result<i64> {
        let (table, scoped) = match kind {
            EntityKind::Settings => ("settings", true),
            EntityKind::Areas => ("areas", true),
            EntityKind::Places => ("places", false),
            EntityKind::Tags => ("tags", false),
            EntityKind::Taggings => ("taggings", true),
            EntityKind::Imports => ("imports", true),
            EntityKind::Exports => ("exports", true),
            EntityKind::Trips => ("trips", true),
            EntityKind::Stats => ("stats", true),
            EntityKind::Digests => ("digests", true),
            EntityKind::Notifications => ("notifications", true),
            EntityKind::Visits => ("visits", true),
            EntityKind::Tracks => ("tracks", true),
            EntityKind::Points => ("points", true),
            EntityKind::RawDataArchives => ("raw_data_archives", true),
        };
        let count = if scoped {
            self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE user_id = ?1"),
                params![user_id],
                |row| row.get(0),
            )?
        } else {
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?
        };
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Read the user's settings document.
    ///
    /// # Errors
    /// Returns an error when the query fails or the stored JSON is invalid.
    pub fn get_settings(&self, user_id: i64) -> Result<Option<Map<String, Value>>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM settings WHERE user_id = ?1", params![user_id], |row| {
                row.get(0)
            })
            .optional()?;
        match data {
            Some(json) => {
                let value: Value = serde_json::from_str(&json)?;
                match value {
                    Value::Object(map) => Ok(Some(map)),
                    _ => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    /// Write the user's settings document, replacing any existing one.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn put_settings(&self, user_id: i64, settings: &Map<String, Value>) -> Result<()> {
        let json = serde_json::to_string(&Value::Object(settings.clone()))?;
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (user_id, data) VALUES (?1, ?2)",
            params![user_id, json],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Places (global, never user-scoped)
    // ------------------------------------------------------------------

    /// Find a place by its exact (name, latitude, longitude) key.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_place(&self, name: &str, latitude: f64, longitude: f64) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM places WHERE name = ?1 AND latitude = ?2 AND longitude = ?3",
                params![name, latitude, longitude],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Create a place; returns the new id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_place(
        &self,
        name: &str,
        latitude: f64,
        longitude: f64,
        source: &str,
        payload: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO places (name, latitude, longitude, source, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, latitude, longitude, source, payload],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ------------------------------------------------------------------
    // Visits
    // ------------------------------------------------------------------

    /// Find a visit by its (name, started_at, ended_at) key.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_visit(
        &self,
        user_id: i64,
        name: &str,
        started_at: &str,
        ended_at: &str,
    ) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM visits
                 WHERE user_id = ?1 AND name = ?2 AND started_at = ?3 AND ended_at = ?4",
                params![user_id, name, started_at, ended_at],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Create a visit; returns the new id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    #[allow(clippy::too_many_arguments)]
    pub fn create_visit(
        &self,
        user_id: i64,
        name: &str,
        started_at: &str,
        ended_at: &str,
        place_id: Option<i64>,
        area_id: Option<i64>,
        payload: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO visits (user_id, name, started_at, ended_at, place_id, area_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![user_id, name, started_at, ended_at, place_id, area_id, payload],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All of the user's visits, for reference-cache construction.
    ///
    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn list_visits(&self, user_id: i64) -> Result<Vec<VisitRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, started_at, ended_at FROM visits WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(VisitRow {
                id: row.get(0)?,
                name: row.get(1)?,
                started_at: row.get(2)?,
                ended_at: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Find an area id by name, for visit area-reference resolution.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_area_by_name(&self, user_id: i64, name: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM areas WHERE user_id = ?1 AND name = ?2 ORDER BY id LIMIT 1",
                params![user_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------

    /// Find a track by its (started_at, ended_at) key.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_track(&self, user_id: i64, started_at: &str, ended_at: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM tracks WHERE user_id = ?1 AND started_at = ?2 AND ended_at = ?3",
                params![user_id, started_at, ended_at],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Create a track; returns the new id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_track(
        &self,
        user_id: i64,
        started_at: &str,
        ended_at: &str,
        payload: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tracks (user_id, started_at, ended_at, payload) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, started_at, ended_at, payload],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Create one ordered segment of a track.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_track_segment(&self, track_id: i64, position: i64, payload: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO track_segments (track_id, position, payload) VALUES (?1, ?2, ?3)",
            params![track_id, position, payload],
        )?;
        Ok(())
    }

    /// Count segments attached to a track.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_track_segments(&self, track_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM track_segments WHERE track_id = ?1",
            params![track_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Points
    // ------------------------------------------------------------------

    /// Bulk-insert a point batch, skipping conflicts on the unique index.
    ///
    /// Returns the number of rows actually inserted, which is what the
    /// importer adds to its created tally.
    ///
    /// # Errors
    /// Returns an error when the transaction or a statement fails.
    pub fn bulk_insert_points(&mut self, user_id: i64, rows: &[PointRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut inserted: u64 = 0;
        let tx = self.conn.transaction()?;
        for chunk in rows.chunks(POINT_INSERT_CHUNK) {
            let values = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT OR IGNORE INTO points
                 (user_id, geometry, timestamp, device_id, import_id, country_id, visit_id,
                  track_id, payload)
                 VALUES {values}"
            );
            let mut bound: Vec<SqlValue> = Vec::with_capacity(chunk.len() * 9);
            for row in chunk {
                bound.push(SqlValue::Integer(user_id));
                bound.push(SqlValue::Text(row.geometry.clone()));
                bound.push(SqlValue::Integer(row.timestamp));
                bound.push(SqlValue::Text(row.device_id.clone()));
                bound.push(opt_integer(row.import_id));
                bound.push(opt_integer(row.country_id));
                bound.push(opt_integer(row.visit_id));
                bound.push(opt_integer(row.track_id));
                bound.push(SqlValue::Text(row.payload.clone()));
            }
            let changed = tx.execute(&sql, rusqlite::params_from_iter(bound))?;
            inserted += changed as u64;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Foreign keys of one stored point, used by tests and diagnostics.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn point_references(
        &self,
        user_id: i64,
        geometry: &str,
        timestamp: i64,
    ) -> Result<Option<(Option<i64>, Option<i64>, Option<i64>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT import_id, country_id, visit_id FROM points
                 WHERE user_id = ?1 AND geometry = ?2 AND timestamp = ?3",
                params![user_id, geometry, timestamp],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Reference data and run-scoped listings
    // ------------------------------------------------------------------

    /// All countries, for reference-cache construction.
    ///
    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn list_countries(&self) -> Result<Vec<CountryRow>> {
        let mut stmt =
            self.conn.prepare("SELECT id, name, iso_a2, iso_a3 FROM countries ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(CountryRow {
                id: row.get(0)?,
                name: row.get(1)?,
                iso_a2: row.get(2)?,
                iso_a3: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Insert one country reference row; returns its id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_country(&self, name: &str, iso_a2: &str, iso_a3: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO countries (name, iso_a2, iso_a3) VALUES (?1, ?2, ?3)",
            params![name, iso_a2, iso_a3],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All of the user's import records, for reference-cache construction.
    ///
    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn list_imports(&self, user_id: i64) -> Result<Vec<ImportRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, source, created_at FROM imports WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ImportRow {
                id: row.get(0)?,
                name: row.get(1)?,
                source: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    // ------------------------------------------------------------------
    // Notifications and attachments
    // ------------------------------------------------------------------

    /// Create a notification for the user; returns its id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_notification(
        &self,
        user_id: i64,
        title: &str,
        created_at: &str,
        payload: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO notifications (user_id, title, created_at, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, title, created_at, payload],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Attach a binary payload to an owning record.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_attachment(
        &self,
        owner_kind: EntityKind,
        owner_id: i64,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO attachments (owner_kind, owner_id, filename, content_type, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![owner_kind.as_str(), owner_id, filename, content_type, data],
        )?;
        Ok(())
    }

    /// Count attachments held by an owning record.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_attachments(&self, owner_kind: EntityKind, owner_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM attachments WHERE owner_kind = ?1 AND owner_id = ?2",
            params![owner_kind.as_str(), owner_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn opt_integer(value: Option<i64>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::Integer)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
