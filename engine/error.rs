use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Every failure the distance engine can report.
///
/// Each variant corresponds to one failure kind of the pipeline; none of them is
/// retried internally. Clean end-of-file is never an error.
#[derive(Debug, Error)]
pub enum DosageError {
    #[error("Failed to open '{}': {source}", path.display())]
    OpenFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Read failure on {context}: {source}")]
    ReadFailure {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Improperly formatted {file}: {message}")]
    FormatError { file: &'static str, message: String },

    #[error("No markers in .gen file.")]
    NoMarkersFound,

    #[error(
        "Insufficient workspace memory: {requested} bytes requested, {available} bytes available."
    )]
    OutOfMemory { requested: usize, available: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{0} not yet supported.")]
    UnsupportedConfiguration(String),

    #[error("Failed to create worker thread {thread_idx}: {source}")]
    ThreadCreationFailure {
        thread_idx: usize,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write '{}': {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DosageError>;

pub(crate) const GEN_FILE: &str = ".gen file";
pub(crate) const SAMPLE_FILE: &str = ".sample file";

impl DosageError {
    pub(crate) fn format(file: &'static str, message: impl Into<String>) -> Self {
        Self::FormatError {
            file,
            message: message.into(),
        }
    }

    pub(crate) fn read(context: impl Into<String>, source: io::Error) -> Self {
        Self::ReadFailure {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(what.into())
    }
}
