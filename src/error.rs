use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Admission validation failure; the message is shown to the caller verbatim.
    #[error("{0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Host not found: task {id} has no host {host}")]
    HostNotFound { id: i64, host: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Center API error: {0}")]
    Center(String),

    /// The center answered with a non-2xx status, e.g. a proxy during a partition.
    #[error("Center unavailable: {0}")]
    CenterUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Failures worth retrying later: transport, storage or center availability.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Database(_) | Self::Cache(_) | Self::CenterUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
