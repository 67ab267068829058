use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Bad caller input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upstream listing API failure. Not retried at the fetch layer.
    #[error("Upstream error (status {}): {body}", fmt_status(.status))]
    Upstream { status: Option<u16>, body: String },

    /// Document store read/write failure. `transient` failures are retried per batch.
    #[error("Store error: {message}")]
    Store { message: String, transient: bool },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("A sync cycle is already in progress")]
    CycleInProgress,

    #[error("Invalid scheduler state: {0}")]
    InvalidState(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

fn fmt_status(status: &Option<u16>) -> String {
    status.map_or_else(|| "n/a".to_string(), |s| s.to_string())
}

impl AppError {
    pub fn store(message: impl Into<String>, transient: bool) -> Self {
        AppError::Store { message: message.into(), transient }
    }

    /// True for store failures worth another attempt with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Store { transient: true, .. })
    }
}

/// Map a sqlx error into the store taxonomy. Lock contention, pool exhaustion
/// and IO failures are transient; constraint or decode failures are not.
pub fn store_error(e: sqlx::Error) -> AppError {
    let transient = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    };
    AppError::Store { message: e.to_string(), transient }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::CycleInProgress | AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
