//! Bulk migration engine for Geotrail user archives.
//!
//! Reconstructs a user's dataset from a portable archive produced by the
//! exporter: extracts to a scratch directory, detects the layout (legacy
//! single-document or current sharded manifest), and drives the per-entity
//! importers in dependency order under bounded memory. Re-running the same
//! archive is safe; natural-key matching and the storage engine's unique
//! point index keep the second run from duplicating anything.
//!
//! The engine assumes at most one concurrent import per user; nothing
//! enforces that, and a killed run leaves partial writes behind (the scratch
//! directory itself is always released).

pub mod archive;
pub mod current;
pub mod entities;
mod error;
pub mod legacy;
pub mod lookup;
pub mod points;
pub mod restore;
pub mod scanner;
pub mod spool;
pub mod tracker;

pub use archive::{import_archive, ImportOptions, DOCUMENT_FILE, FILES_DIR, MANIFEST_FILE};
pub use error::ImportError;
pub use lookup::ReferenceCache;
pub use points::PointImporter;

/// Records per storage flush, for point batches and staged-section replay.
pub const DEFAULT_BATCH_SIZE: usize = 5000;
