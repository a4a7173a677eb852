use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("test tool error: {detail}")]
    ToolError { detail: String },
    #[error("test tool timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("latency probe to {target} failed: {detail}")]
    ProbeUnreachable { target: String, detail: String },
    #[error("metrics store error: {0}")]
    Persistence(#[from] StoreError),
    #[error("classifier artifact error: {0}")]
    Classifier(String),
    #[error("report error: {0}")]
    Report(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path}: unexpected header '{found}'")]
    Header { path: PathBuf, found: String },
}

impl Error {
    /// Short label used for skip-reason metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ToolError { .. } => "tool_error",
            Error::Timeout { .. } => "timeout",
            Error::ProbeUnreachable { .. } => "probe_unreachable",
            Error::Persistence(_) => "persistence",
            Error::Classifier(_) => "classifier",
            Error::Report(_) => "report",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
        }
    }

    pub fn tool(detail: impl Into<String>) -> Self {
        Error::ToolError {
            detail: detail.into(),
        }
    }
}
