//! Crate-level error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid format pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Failed to watch path: {0}")]
    Watch(#[from] notify::Error),

    #[error("Position file error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;
