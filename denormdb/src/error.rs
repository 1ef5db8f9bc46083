use thiserror::Error;

#[derive(Error, Debug)]
pub enum DenormError {
    /// Invalid relationship declaration, raised while the schema is expanded.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A referenced id does not resolve, or a list/cache field has the wrong shape.
    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    /// A direct write affected no documents although one was expected.
    #[error("Direct write to {collection}/{id} affected no documents")]
    WriteFailure { collection: String, id: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl DenormError {
    /// Shorthand for the "referenced id does not exist" inconsistency.
    pub(crate) fn dangling(collection: &str, id: &str, context: &str) -> Self {
        DenormError::DataInconsistency(format!(
            "{context}: document '{id}' does not exist in collection '{collection}'"
        ))
    }
}

pub type Result<T> = std::result::Result<T, DenormError>;
