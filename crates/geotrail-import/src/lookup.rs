//! Run-scoped reference lookup cache.
//!
//! Built from three store queries exactly once per run, before the first
//! visit/point batch, then treated as immutable. Records created later in
//! the run are deliberately invisible: the fixed import order guarantees the
//! kinds a point can reference are complete by the time points import, and
//! anything referencing out of that order simply fails to resolve.

use std::collections::HashMap;

use geotrail_core::RawRecord;
use geotrail_store_sqlite::Store;

use crate::ImportError;

/// Immutable keyed maps used to resolve point foreign keys.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    imports: HashMap<(String, String, String), i64>,
    countries: HashMap<(String, String, String), i64>,
    countries_by_name: HashMap<String, i64>,
    visits: HashMap<(String, String, String), i64>,
}

impl ReferenceCache {
    /// Load the user's import records, all countries, and the user's visits.
    ///
    /// # Errors
    /// Returns an error when any of the three listing queries fails.
    pub fn load(store: &Store, user_id: i64) -> Result<Self, ImportError> {
        let mut cache = Self::default();
        for row in store.list_imports(user_id)? {
            cache.imports.insert((row.name, row.source, row.created_at), row.id);
        }
        for row in store.list_countries()? {
            cache.countries_by_name.insert(row.name.clone(), row.id);
            cache.countries.insert((row.name, row.iso_a2, row.iso_a3), row.id);
        }
        for row in store.list_visits(user_id)? {
            cache.visits.insert((row.name, row.started_at, row.ended_at), row.id);
        }
        tracing::debug!(
            imports = cache.imports.len(),
            countries = cache.countries_by_name.len(),
            visits = cache.visits.len(),
            "reference cache loaded"
        );
        Ok(cache)
    }

    /// Resolve an import-reference payload: (name, source, created_at).
    #[must_use]
    pub fn resolve_import(&self, reference: &RawRecord) -> Option<i64> {
        let key = (
            reference.key_field("name")?,
            reference.key_field("source")?,
            reference.key_field("created_at")?,
        );
        self.imports.get(&key).copied()
    }

    /// Resolve a country-reference payload: name plus both ISO codes,
    /// falling back to the name alone.
    #[must_use]
    pub fn resolve_country(&self, reference: &RawRecord) -> Option<i64> {
        let name = reference.key_field("name")?;
        if let (Some(a2), Some(a3)) =
            (reference.key_field("iso_a2"), reference.key_field("iso_a3"))
        {
            if let Some(id) = self.countries.get(&(name.clone(), a2, a3)) {
                return Some(*id);
            }
        }
        self.countries_by_name.get(&name).copied()
    }

    /// Resolve a visit-reference payload: (name, started_at, ended_at).
    #[must_use]
    pub fn resolve_visit(&self, reference: &RawRecord) -> Option<i64> {
        let key = (
            reference.key_field("name")?,
            reference.key_field("started_at")?,
            reference.key_field("ended_at")?,
        );
        self.visits.get(&key).copied()
    }
}
