use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{DatasetInfo, DownloadSummary, ProgressEvent, ProgressSink};
use crate::models::Dataset;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_download(result: &DownloadSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_datasets(result: &[Dataset]) -> io::Result<()> {
        Self::print_json(&result)
    }

    pub fn print_info(result: &DatasetInfo) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress sink that forwards phase events to the log stream.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        info!("{}", event.message);
    }
}
