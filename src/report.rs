use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::error;

use crate::error::MlhubError;
use crate::ledger::LedgerEntry;

pub const REPORT_FILE_NAME: &str = "err_report.csv";

#[derive(Debug, Clone, Serialize)]
pub struct FailureRow {
    pub timestamp: String,
    pub dataset_id: String,
    pub collection_id: String,
    pub item_id: Option<String>,
    pub asset_key: String,
    pub asset_url: String,
    pub save_path: String,
    pub error: String,
}

/// Accumulates terminal per-asset failures and writes them out as CSV.
///
/// The report file only exists when at least one failure occurred; a clean
/// run removes any report left behind by an earlier one.
pub struct ErrorReporter {
    dataset_id: String,
    report_path: Utf8PathBuf,
    rows: Mutex<Vec<FailureRow>>,
}

impl ErrorReporter {
    pub fn new(dataset_id: &str, dataset_dir: &Utf8Path) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            report_path: dataset_dir.join(REPORT_FILE_NAME),
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, entry: &LedgerEntry, message: &str) {
        error!(
            collection_id = entry.identity.collection_id,
            item_id = entry.identity.item_id.as_deref().unwrap_or("-"),
            asset_key = entry.identity.asset_key,
            url = entry.url,
            message,
            "asset download failed"
        );
        let row = FailureRow {
            timestamp: chrono::Utc::now().to_rfc3339(),
            dataset_id: self.dataset_id.clone(),
            collection_id: entry.identity.collection_id.clone(),
            item_id: entry.identity.item_id.clone(),
            asset_key: entry.identity.asset_key.clone(),
            asset_url: entry.url.clone(),
            save_path: entry.save_path.clone(),
            error: message.to_string(),
        };
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(row);
    }

    pub fn failure_count(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Write the report; returns its path, or `None` when nothing failed.
    pub fn finalize(self) -> Result<Option<Utf8PathBuf>, MlhubError> {
        let rows = self.rows.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        if rows.is_empty() {
            if self.report_path.as_std_path().exists() {
                fs::remove_file(self.report_path.as_std_path())
                    .map_err(|err| MlhubError::Report(err.to_string()))?;
            }
            return Ok(None);
        }

        let mut writer = csv::Writer::from_path(self.report_path.as_std_path())
            .map_err(|err| MlhubError::Report(err.to_string()))?;
        for row in &rows {
            writer
                .serialize(row)
                .map_err(|err| MlhubError::Report(err.to_string()))?;
        }
        writer
            .flush()
            .map_err(|err| MlhubError::Report(err.to_string()))?;
        Ok(Some(self.report_path))
    }
}
