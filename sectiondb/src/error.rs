use thiserror::Error;

#[derive(Error, Debug)]
pub enum SectionDbError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Record not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    #[error("Transaction rolled back: {0}")]
    StoreTransactionFailed(#[source] Box<SectionDbError>),

    #[error("Projection '{view}' is inconsistent: {reason}")]
    ProjectionInconsistent { view: String, reason: String },

    #[error("List control rejected patch: {reason}")]
    PatchRejected { reason: String },

    #[error("Binding '{0}' is not bound to a store")]
    Unbound(String),

    #[error("Selection {index} out of range for {count} segments")]
    InvalidSelection { index: usize, count: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SectionDbError>;
