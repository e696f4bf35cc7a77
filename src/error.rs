use std::path::PathBuf;

/// Errors raised by the pipeline library. The binary wraps these in `anyhow`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse CSV {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path:?} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },

    #[error("invalid granule name '{0}'")]
    InvalidGranule(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object listing failed: {0}")]
    Listing(String),

    #[error("job invocation failed: {0}")]
    Job(String),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),

    #[error("malformed extent for {granule}: {reason}")]
    MalformedExtent { granule: String, reason: String },

    #[error("beam {beam} is missing column '{column}'")]
    MissingBeamData { beam: String, column: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
