use std::sync::atomic::AtomicBool;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::info;

use crate::catalog::Materializer;
use crate::domain::{BoundingBox, DatasetRef, IfExists, TemporalQuery};
use crate::error::MlhubError;
use crate::filter::{CollectionFilter, FilterSet, parse_intersects};
use crate::ledger::AssetLedger;
use crate::models::{self, ArchiveInfo, Dataset, DatasetPages};
use crate::report::ErrorReporter;
use crate::scheduler::Scheduler;
use crate::session::ApiSession;

#[derive(Debug, Clone)]
pub struct DownloadArgs {
    pub dataset: DatasetRef,
    pub output_dir: Utf8PathBuf,
    pub if_exists: IfExists,
    pub catalog_only: bool,
    pub concurrency: usize,
    pub collection_filter: Option<CollectionFilter>,
    pub temporal: Option<TemporalQuery>,
    pub bbox: Option<BoundingBox>,
    pub intersects: Option<serde_json::Value>,
    /// Reset entries failed in an earlier run back to pending first.
    pub retry_failed: bool,
}

/// Outcome of one download run. Failed assets do not make the run an error;
/// `failed > 0` with a report path is a partial success.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub dataset_id: String,
    pub output_dir: String,
    pub catalog_only: bool,
    pub discovered: usize,
    pub accepted: usize,
    pub complete: usize,
    pub skipped: usize,
    pub failed: usize,
    pub report_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetInfo {
    pub dataset: Dataset,
    pub archives: Vec<CollectionArchiveStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionArchiveStatus {
    pub collection_id: String,
    pub archive_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<S: ApiSession> {
    session: S,
}

impl<S: ApiSession> App<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }

    /// Materialize a dataset: fetch and unpack its catalog archive, build
    /// the filtered worklist, then drain it with concurrent workers.
    pub fn download(
        &self,
        args: DownloadArgs,
        cancel: &AtomicBool,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, MlhubError> {
        // filter validation happens before any network activity
        let intersects = args
            .intersects
            .as_ref()
            .map(parse_intersects)
            .transpose()?;
        let filters = FilterSet::new(
            args.collection_filter.clone(),
            args.temporal,
            args.bbox,
            intersects,
        )?;

        sink.event(ProgressEvent {
            message: format!("phase=Resolve; dataset {}", args.dataset),
            elapsed: None,
        });
        let dataset = models::fetch_dataset(&self.session, &args.dataset)?;
        info!(
            dataset_id = dataset.id,
            collections = dataset.collections.len(),
            "resolved dataset"
        );

        let materializer = Materializer::new(
            &self.session,
            &dataset.id,
            &args.output_dir,
            args.if_exists,
        );
        sink.event(ProgressEvent {
            message: format!("phase=Catalog; fetching archive for {}", dataset.id),
            elapsed: None,
        });
        materializer.fetch_and_unpack()?;

        if args.catalog_only {
            sink.event(ProgressEvent {
                message: "phase=Catalog; catalog only, stopping".to_string(),
                elapsed: None,
            });
            return Ok(DownloadSummary {
                dataset_id: dataset.id,
                output_dir: args.output_dir.to_string(),
                catalog_only: true,
                discovered: 0,
                accepted: 0,
                complete: 0,
                skipped: 0,
                failed: 0,
                report_path: None,
            });
        }

        let dataset_dir = materializer.dataset_dir();
        let ledger = AssetLedger::open(dataset_dir.as_std_path())?;
        if args.retry_failed {
            let reset = ledger.reset_failed()?;
            info!(reset, "reset failed entries for retry");
        }

        sink.event(ProgressEvent {
            message: "phase=Worklist; scanning catalog items".to_string(),
            elapsed: None,
        });
        let counts = materializer.build_worklist(&ledger, &filters)?;

        sink.event(ProgressEvent {
            message: format!("phase=Download; {} assets accepted", counts.accepted),
            elapsed: None,
        });
        let reporter = ErrorReporter::new(&dataset.id, &dataset_dir);
        let scheduler = Scheduler::new(
            &self.session,
            &ledger,
            &reporter,
            &dataset_dir,
            args.if_exists,
            args.concurrency,
        );
        let tally = scheduler.run(cancel)?;
        let report_path = reporter.finalize()?;

        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; complete={} skipped={} failed={}",
                tally.complete, tally.skipped, tally.failed
            ),
            elapsed: None,
        });

        Ok(DownloadSummary {
            dataset_id: dataset.id,
            output_dir: args.output_dir.to_string(),
            catalog_only: false,
            discovered: counts.discovered,
            accepted: counts.accepted,
            complete: tally.complete,
            skipped: tally.skipped,
            failed: tally.failed,
            report_path: report_path.map(|path| path.to_string()),
        })
    }

    /// List datasets, optionally filtered by tags or text phrases. Pages
    /// are pulled lazily from the API as the iterator advances.
    pub fn list_datasets(
        &self,
        tags: &[String],
        text: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<Vec<Dataset>, MlhubError> {
        sink.event(ProgressEvent {
            message: "phase=Resolve; listing datasets".to_string(),
            elapsed: None,
        });
        DatasetPages::new(&self.session, tags, text).collect()
    }

    pub fn dataset_info(
        &self,
        dataset: &DatasetRef,
        sink: &dyn ProgressSink,
    ) -> Result<DatasetInfo, MlhubError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; dataset {dataset}"),
            elapsed: None,
        });
        let dataset = models::fetch_dataset(&self.session, dataset)?;
        let mut archives = Vec::with_capacity(dataset.collections.len());
        for collection in &dataset.collections {
            let info: Option<ArchiveInfo> =
                models::collection_archive_info(&self.session, &collection.id)?;
            archives.push(CollectionArchiveStatus {
                collection_id: collection.id.clone(),
                archive_size: info.map(|info| info.size),
            });
        }
        Ok(DatasetInfo { dataset, archives })
    }
}
