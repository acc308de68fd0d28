use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// ImportError – everything that aborts an import
// ---------------------------------------------------------------------------

/// Fatal import errors.
///
/// Column misses, cell coercion failures and empty lookups are not errors:
/// they are logged, kept as raw text, or surface as `None` respectively.
#[derive(Error, Debug)]
pub enum ImportError {
    // ----- schema / registry -----
    #[error("no result file format named '{0}' in the format registry")]
    SchemaNotFound(String),

    #[error("result file format '{0}' already exists in the format registry")]
    DuplicateSchema(String),

    #[error("invalid result file format '{name}': {message}")]
    MalformedSchema { name: String, message: String },

    // ----- setup -----
    #[error("import setup is not complete: {}", .0.join("; "))]
    IncompleteSetup(Vec<String>),

    #[error("invalid import setup: {0}")]
    InvalidSetup(String),

    // ----- discovery -----
    #[error("no files of type '{file_type}' found in {}", dir.display())]
    NoMatchingFiles { dir: PathBuf, file_type: String },

    #[error("none of the time formats {formats:?} parses the first data row of {}", file.display())]
    TimestampFormatUnresolved { file: PathBuf, formats: Vec<String> },

    #[error("start time column could not be located in {}", file.display())]
    TimestampColumnUnresolved { file: PathBuf },

    // ----- results -----
    #[error("no spectra were imported for any fit scenario")]
    NoData,

    #[error("fit scenario '{fit_id}': cannot {action} while {stage}")]
    ParserStage {
        fit_id: String,
        action: &'static str,
        stage: &'static str,
    },

    // ----- wrapped -----
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl ImportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ImportError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(name: &str, message: impl Into<String>) -> Self {
        ImportError::MalformedSchema {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Result alias used throughout the data layer.
pub type ImportResult<T> = Result<T, ImportError>;
