//! Error types for the Cinnabar compilation pipeline

use std::fmt;
use thiserror::Error;

/// Source location in JavaScript code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
    /// Byte offset in source
    pub offset: usize,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32, offset: usize) -> Self {
        Self { line, column, offset }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Main error type for Cinnabar
///
/// Only conditions that cross the embedding boundary are errors. Bailouts and
/// optimization failures are encoded in the tri-state phase outcome instead
/// (see [`crate::backend::PhaseOutcome`]); they always fall back to baseline
/// code and never surface here. Invariant violations inside the pipeline are
/// fatal assertions, not error values.
#[derive(Error, Debug)]
pub enum Error {
    /// Baseline compilation failed because the source is invalid
    #[error("SyntaxError: {message} at {location}")]
    CompileError {
        message: String,
        location: SourceLocation,
    },

    /// Internal pipeline error
    #[error("InternalError: {0}")]
    InternalError(String),

    /// Code cache blob could not be decoded
    #[error("CacheError: {0}")]
    CacheError(String),
}

impl Error {
    /// Create a new compile error
    pub fn compile_error(message: impl Into<String>, location: SourceLocation) -> Self {
        Error::CompileError {
            message: message.into(),
            location,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }
}

/// Result type alias for Cinnabar
pub type Result<T> = std::result::Result<T, Error>;
