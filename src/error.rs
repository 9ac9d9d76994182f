use thiserror::Error;

/// Unified error type for pipeline I/O, storage, and path validation.
///
/// The extraction/normalization functions themselves are total and never
/// return this; it only surfaces from the boundaries (files, SQLite, the
/// external ExifTool process).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Path(String),

    #[error("{0}")]
    Exif(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
