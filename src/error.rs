use actix_web::http::StatusCode;
use actix_web::ResponseError;
use thiserror::Error;
use uuid::Uuid;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// A connection was found in the waiting pool and a session at once, or
    /// in two sessions. A server bug: the offending connection is forced out
    /// of all matching state and the engine keeps running.
    #[error("matching invariant violated for connection {conn}")]
    PoolInvariantViolation { conn: Uuid },
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::PoolInvariantViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
