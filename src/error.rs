//! Error type shared by every stage of the conversion pipeline.

use std::io;

/// Errors that can arise while parsing manifests, fetching segments,
/// decrypting content or writing the HLS output tree.
#[derive(thiserror::Error, Debug)]
pub enum ConverterError {
    #[error("I/O error: {0}: {1}")]
    Io(#[source] io::Error, String),

    #[error("parsing error: {0}")]
    Parsing(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("network connection error: {0}")]
    NetworkConnect(String),

    #[error("decryption error: {0}")]
    Decrypting(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("no representation found: {0}")]
    RepresentationNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ConverterError {
    pub fn io(e: io::Error, context: impl Into<String>) -> Self {
        ConverterError::Io(e, context.into())
    }
}

pub type Result<T> = std::result::Result<T, ConverterError>;
