use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MlhubError {
    #[error("invalid dataset reference: {0}")]
    InvalidDatasetRef(String),

    #[error("invalid DOI: {0}")]
    InvalidDoi(String),

    #[error("invalid bounding box: {0}")]
    InvalidBbox(String),

    #[error("invalid datetime filter: {0}")]
    InvalidDatetime(String),

    #[error("invalid filter combination: {0}")]
    InvalidFilter(String),

    #[error("no API key found: {0}")]
    ApiKeyNotFound(String),

    #[error("failed to read profiles file at {0}")]
    ProfilesRead(PathBuf),

    #[error("failed to parse profiles file: {0}")]
    ProfilesParse(String),

    #[error("MLHub request failed: {0}")]
    ApiHttp(String),

    #[error("MLHub returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("dataset does not exist: {0}")]
    DatasetNotFound(String),

    #[error("unexpected API response: {0}")]
    ApiDecode(String),

    #[error("catalog archive fetch failed: {0}")]
    CatalogFetch(String),

    #[error("catalog archive is corrupt: {0}")]
    CatalogCorrupt(String),

    #[error("no assets matched the active filters for dataset {0}")]
    EmptyWorklist(String),

    #[error("asset ledger error: {0}")]
    Ledger(String),

    #[error("error report write failed: {0}")]
    Report(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl From<sled::Error> for MlhubError {
    fn from(err: sled::Error) -> Self {
        MlhubError::Ledger(err.to_string())
    }
}

impl From<postcard::Error> for MlhubError {
    fn from(err: postcard::Error) -> Self {
        MlhubError::Ledger(format!("entry encoding: {err}"))
    }
}
