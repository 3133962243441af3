use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the ORM layer.
///
/// Configuration mistakes (duplicate model names, unsupported dialects,
/// deleting a value with no primary key) are deliberately typed variants
/// rather than panics, so the host application decides how to react.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Change-set encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Model `{0}` already registered")]
    DuplicateModel(String),

    #[error("Unsupported dialect: {0}")]
    UnsupportedDialect(String),

    #[error("Primary key must be set for this operation")]
    MissingPrimaryKey,

    #[error("Database connection is not open")]
    NotConnected,

    #[error("Query error: {0}")]
    Query(String),
}
