//! Error types for the Biogate core library

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown modality: {0}")]
    UnknownModality(String),

    #[error("Invalid backend identity: {0}")]
    InvalidBackendId(String),

    #[error("Unknown failure reason: {0}")]
    UnknownFailureReason(String),
}
