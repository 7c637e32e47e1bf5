use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("session is not secure yet")]
    NotSecure,

    #[error("chat session is closed")]
    Closed,

    #[error("crypto failure: {0}")]
    Crypto(#[from] crypto_core::CryptoError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}
