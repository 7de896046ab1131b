//! Error and Result module

use derive_more::{Display, Error, From};

/// Errors raised while building the error-page configuration.
///
/// Any of these prevents the middleware from being installed.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Unable to open the configured log destination
    #[display("Failed to open log destination: {_0}")]
    #[from]
    Io(std::io::Error),

    /// Malformed directive structure (braces, unexpected tokens)
    #[display("line {line}: {msg}")]
    Syntax { line: usize, msg: String },

    /// Wrong number of arguments supplied to a directive line
    #[display("line {line}: {msg}")]
    Argument { line: usize, msg: String },

    /// Status code (or the generic `*` entry) was registered twice
    #[display("line {line}: Duplicate status code entry: {key}")]
    DuplicateEntry { line: usize, key: String },

    /// Status token is neither `*` nor a valid numeric status code
    #[display("line {line}: Expecting a numeric status code or '*', got '{token}'")]
    InvalidCode { line: usize, token: String },

    /// Invalid log rotation sub-directive
    #[display("line {line}: {msg}")]
    Roller { line: usize, msg: String },
}

impl ConfigError {
    /// Attach a source line number to an error produced without one.
    pub(crate) fn at_line(self, at: usize) -> Self {
        match self {
            Self::Syntax { msg, .. } => Self::Syntax { line: at, msg },
            Self::Argument { msg, .. } => Self::Argument { line: at, msg },
            Self::DuplicateEntry { key, .. } => Self::DuplicateEntry { line: at, key },
            Self::InvalidCode { token, .. } => Self::InvalidCode { line: at, token },
            Self::Roller { msg, .. } => Self::Roller { line: at, msg },
            err => err,
        }
    }
}

/// Errors which occur when loading an error page from disk.
///
/// These never reach the client; the renderer logs them and degrades
/// to the default error response.
#[derive(Debug, Display, Error)]
pub enum RenderError {
    /// Page file could not be opened
    #[display("{_0}")]
    Open(std::io::Error),

    /// Page file was opened but could not be read completely
    #[display("{_0}")]
    Read(std::io::Error),

    /// Blocking thread-pool refused or dropped the read
    #[display("blocking task failed")]
    Blocking,
}
