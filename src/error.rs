use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Job queue is at capacity")]
    QueueFull,

    #[error("Load balancer error: {0}")]
    LoadBalancer(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GridError>;
