use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use camino::Utf8Path;
use tracing::{debug, error, info};

use crate::domain::IfExists;
use crate::download::{DownloadOutcome, ResumableDownloader};
use crate::error::MlhubError;
use crate::ledger::AssetLedger;
use crate::report::ErrorReporter;
use crate::session::ApiSession;

pub const DEFAULT_CONCURRENCY: usize = 16;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadTally {
    /// Assets transferred (fully or via resume) this run.
    pub complete: usize,
    /// Assets satisfied without a transfer (skip mode or size match).
    pub skipped: usize,
    /// Assets that ended the run in a terminal failure.
    pub failed: usize,
}

impl DownloadTally {
    fn add(&mut self, other: DownloadTally) {
        self.complete += other.complete;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Drains the ledger's pending entries with a bounded pool of blocking
/// workers.
///
/// The ledger claim is the only shared admission gate: a worker that loses
/// the `try_claim` race simply moves on, so no asset is ever transferred
/// twice concurrently. One asset's failure is recorded and never aborts
/// the run.
pub struct Scheduler<'a> {
    session: &'a dyn ApiSession,
    ledger: &'a AssetLedger,
    reporter: &'a ErrorReporter,
    dataset_dir: &'a Utf8Path,
    if_exists: IfExists,
    concurrency: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        session: &'a dyn ApiSession,
        ledger: &'a AssetLedger,
        reporter: &'a ErrorReporter,
        dataset_dir: &'a Utf8Path,
        if_exists: IfExists,
        concurrency: usize,
    ) -> Self {
        Self {
            session,
            ledger,
            reporter,
            dataset_dir,
            if_exists,
            concurrency: concurrency.max(1),
        }
    }

    pub fn run(&self, cancel: &AtomicBool) -> Result<DownloadTally, MlhubError> {
        let pending = self.ledger.pending_keys()?;
        if pending.is_empty() {
            return Ok(DownloadTally::default());
        }
        info!(
            pending = pending.len(),
            concurrency = self.concurrency,
            "starting asset downloads"
        );

        let queue = Mutex::new(VecDeque::from(pending));
        let workers = self.concurrency.min(queue.lock().map_or(1, |q| q.len()));

        let tally = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| self.worker_loop(&queue, cancel)));
            }
            let mut total = DownloadTally::default();
            for handle in handles {
                match handle.join() {
                    Ok(worker_tally) => total.add(worker_tally),
                    Err(_) => error!("download worker panicked"),
                }
            }
            total
        });

        self.ledger.flush()?;
        Ok(tally)
    }

    fn worker_loop(&self, queue: &Mutex<VecDeque<String>>, cancel: &AtomicBool) -> DownloadTally {
        let mut tally = DownloadTally::default();
        loop {
            if cancel.load(Ordering::Relaxed) {
                debug!("cancellation requested, worker exiting");
                break;
            }
            let Some(key) = queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front()
            else {
                break;
            };
            match self.ledger.try_claim(&key) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    error!(key, error = %err, "ledger claim failed");
                    continue;
                }
            }
            self.process_claim(&key, &mut tally);
        }
        tally
    }

    fn process_claim(&self, key: &str, tally: &mut DownloadTally) {
        let entry = match self.ledger.get(key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                error!(key, "claimed entry vanished from ledger");
                return;
            }
            Err(err) => {
                error!(key, error = %err, "ledger read failed");
                return;
            }
        };

        let out_file = self.dataset_dir.join(&entry.save_path);
        let downloader = ResumableDownloader::new(
            self.session,
            &entry.url,
            out_file.as_std_path(),
            self.if_exists,
        );
        match downloader.run() {
            Ok(result) => {
                if result.outcome != DownloadOutcome::Skipped {
                    if let Err(err) = self.ledger.set_remote_size(key, result.len) {
                        error!(key, error = %err, "failed to record remote size");
                    }
                }
                if let Err(err) = self.ledger.mark_complete(key) {
                    error!(key, error = %err, "failed to mark entry complete");
                }
                match result.outcome {
                    DownloadOutcome::Fetched | DownloadOutcome::Resumed => tally.complete += 1,
                    DownloadOutcome::AlreadyComplete | DownloadOutcome::Skipped => {
                        tally.skipped += 1
                    }
                }
            }
            Err(err) => {
                // terminal for this asset, not for the run
                let message = err.to_string();
                if let Err(mark_err) = self.ledger.mark_failed(key, &message) {
                    error!(key, error = %mark_err, "failed to mark entry failed");
                }
                self.reporter.record(&entry, &message);
                tally.failed += 1;
            }
        }
    }
}
