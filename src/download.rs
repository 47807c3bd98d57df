use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::IfExists;
use crate::error::MlhubError;
use crate::session::ApiSession;

const MAX_ATTEMPTS: usize = 4;
const RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Fetched in full from offset zero.
    Fetched,
    /// Continued an existing partial file via a range request.
    Resumed,
    /// Local length already matches the remote size; nothing transferred.
    AlreadyComplete,
    /// Destination existed and `IfExists::Skip` was set; no network call.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadResult {
    pub outcome: DownloadOutcome,
    /// Final on-disk size. Equals the remote size except for `Skipped`.
    pub len: u64,
}

/// Resumable downloader for one remote file.
///
/// Used for both the catalog archive and individual assets, so the
/// skip / size-match / range-resume decision is identical for the two.
/// Partial output is strictly appended, never rewritten, which makes any
/// interrupted run a valid resume point.
pub struct ResumableDownloader<'a> {
    session: &'a dyn ApiSession,
    url: &'a str,
    out_file: &'a Path,
    if_exists: IfExists,
}

impl<'a> ResumableDownloader<'a> {
    pub fn new(
        session: &'a dyn ApiSession,
        url: &'a str,
        out_file: &'a Path,
        if_exists: IfExists,
    ) -> Self {
        Self {
            session,
            url,
            out_file,
            if_exists,
        }
    }

    pub fn run(&self) -> Result<DownloadResult, MlhubError> {
        if let Some(parent) = self.out_file.parent() {
            fs::create_dir_all(parent).map_err(|err| MlhubError::Filesystem(err.to_string()))?;
        }

        if self.out_file.exists() {
            match self.if_exists {
                IfExists::Skip => {
                    debug!(out_file = %self.out_file.display(), "exists, skipping");
                    return Ok(DownloadResult {
                        outcome: DownloadOutcome::Skipped,
                        len: local_len(self.out_file)?,
                    });
                }
                IfExists::Overwrite => {
                    fs::remove_file(self.out_file)
                        .map_err(|err| MlhubError::Filesystem(err.to_string()))?;
                }
                IfExists::Resume => {}
            }
        }

        // Transient mid-transfer failures are retried here, within the
        // caller's single claim; each attempt resumes from whatever bytes
        // already landed on disk.
        let mut attempt = 0usize;
        loop {
            match self.transfer() {
                Ok(result) => return Ok(result),
                Err(err) if attempt + 1 < MAX_ATTEMPTS && is_transient(&err) => {
                    warn!(
                        url = self.url,
                        attempt,
                        error = %err,
                        "transient download failure, retrying"
                    );
                    thread::sleep(Duration::from_millis(RETRY_DELAY_MS << attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn transfer(&self) -> Result<DownloadResult, MlhubError> {
        let mut start = local_len(self.out_file)?;
        let mut stream = self.session.open_stream(self.url, start)?;

        if start > stream.total_len {
            // local file is longer than the remote: stale or corrupt, refetch
            warn!(
                out_file = %self.out_file.display(),
                local = start,
                remote = stream.total_len,
                "local file larger than remote, refetching"
            );
            fs::remove_file(self.out_file)
                .map_err(|err| MlhubError::Filesystem(err.to_string()))?;
            start = 0;
            stream = self.session.open_stream(self.url, 0)?;
        }

        if start == stream.total_len {
            return Ok(DownloadResult {
                outcome: DownloadOutcome::AlreadyComplete,
                len: stream.total_len,
            });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.out_file)
            .map_err(|err| MlhubError::Filesystem(err.to_string()))?;
        io::copy(&mut stream.reader, &mut file)
            .map_err(|err| MlhubError::ApiHttp(format!("stream read failed: {err}")))?;

        let final_len = local_len(self.out_file)?;
        if final_len != stream.total_len {
            return Err(MlhubError::ApiHttp(format!(
                "truncated transfer of {}: {final_len} of {} bytes",
                self.url, stream.total_len
            )));
        }

        Ok(DownloadResult {
            outcome: if start > 0 {
                DownloadOutcome::Resumed
            } else {
                DownloadOutcome::Fetched
            },
            len: final_len,
        })
    }
}

fn local_len(path: &Path) -> Result<u64, MlhubError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(MlhubError::Filesystem(err.to_string())),
    }
}

/// A transfer error worth another attempt within the same claim. Client
/// errors like 403/404 are terminal for the asset.
fn is_transient(err: &MlhubError) -> bool {
    match err {
        MlhubError::ApiHttp(_) => true,
        MlhubError::ApiStatus { status, .. } => matches!(status, 408 | 429 | 500..=599),
        _ => false,
    }
}
