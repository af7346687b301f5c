use crate::models::classify_types::ClientId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Folder watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed packet: {0}")]
    Decode(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Queue of pool '{0}' is full")]
    QueueFull(String),

    #[error("Pool '{0}' is shut down")]
    PoolClosed(String),

    #[error("No dispatcher registered for client {0}")]
    UnknownClient(ClientId),

    #[error("{0}")]
    Message(String),
}

impl From<ort::Error> for AppError {
    fn from(err: ort::Error) -> Self {
        AppError::Inference(err.to_string())
    }
}

impl From<prost::DecodeError> for AppError {
    fn from(err: prost::DecodeError) -> Self {
        AppError::Decode(err.to_string())
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Message(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Message(msg.to_string())
    }
}
