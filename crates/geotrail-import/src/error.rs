use geotrail_store_sqlite::StoreError;

/// Run-aborting import failures.
///
/// Per-record problems (validation, unresolved references, missing files)
/// never surface here; they are logged and skipped where they happen.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("unrecognized archive format: neither a manifest nor a document file found")]
    UnrecognizedFormat,
    #[error("unsupported manifest version: {0}")]
    UnsupportedManifestVersion(u32),
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
