//! Mapper error types

use thiserror::Error;

/// Errors raised while parsing or mapping an image
#[derive(Debug, Error)]
pub enum MapperError {
    /// The image bytes are not a well-formed Mach-O file of the expected
    /// shape
    #[error("malformed image: {0}")]
    Malformed(String),

    /// The image uses a feature the mapper does not handle
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A non-weak import could not be resolved anywhere in the dependency
    /// graph
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// A dependency image could not be obtained from the image source
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Writing or protecting task memory failed
    #[error("task memory error: {0}")]
    Task(String),
}

/// Mapper result
pub type MapperResult<T> = Result<T, MapperError>;
