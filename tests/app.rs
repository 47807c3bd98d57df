use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::json;

use stac_dataset_manager::app::{App, DownloadArgs, ProgressEvent, ProgressSink};
use stac_dataset_manager::domain::IfExists;
use stac_dataset_manager::error::MlhubError;
use stac_dataset_manager::filter::CollectionFilter;
use stac_dataset_manager::report::REPORT_FILE_NAME;
use stac_dataset_manager::session::{ApiSession, RemoteStream};

const DATASET_ID: &str = "test_dataset";

struct Quiet;

impl ProgressSink for Quiet {
    fn event(&self, _event: ProgressEvent) {}
}

struct HubInner {
    dataset: serde_json::Value,
    archive: Vec<u8>,
    assets: HashMap<String, Vec<u8>>,
    /// url -> HTTP status returned instead of the body
    failures: Mutex<HashMap<String, u16>>,
    json_calls: AtomicUsize,
    stream_opens: AtomicUsize,
}

/// In-memory stand-in for the catalog API: one dataset, one archive and a
/// url-to-bytes asset table.
#[derive(Clone)]
struct MockHub {
    inner: Arc<HubInner>,
}

impl MockHub {
    fn new(archive: Vec<u8>, assets: &[(&str, &[u8])]) -> Self {
        let dataset = json!({
            "id": DATASET_ID,
            "title": "Test Dataset",
            "collections": [
                {"id": "source", "types": ["source_imagery"]},
                {"id": "labels", "types": ["labels"]},
            ],
        });
        Self {
            inner: Arc::new(HubInner {
                dataset,
                archive,
                assets: assets
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_vec()))
                    .collect(),
                failures: Mutex::new(HashMap::new()),
                json_calls: AtomicUsize::new(0),
                stream_opens: AtomicUsize::new(0),
            }),
        }
    }

    fn fail_url(&self, url: &str, status: u16) {
        self.inner
            .failures
            .lock()
            .unwrap()
            .insert(url.to_string(), status);
    }

    fn stream_opens(&self) -> usize {
        self.inner.stream_opens.load(Ordering::Relaxed)
    }

    fn json_calls(&self) -> usize {
        self.inner.json_calls.load(Ordering::Relaxed)
    }
}

impl ApiSession for MockHub {
    fn get_json(
        &self,
        path: &str,
        _params: &[(&str, String)],
    ) -> Result<serde_json::Value, MlhubError> {
        self.inner.json_calls.fetch_add(1, Ordering::Relaxed);
        if path == format!("datasets/{DATASET_ID}") {
            return Ok(self.inner.dataset.clone());
        }
        Err(MlhubError::ApiStatus {
            status: 404,
            message: format!("no route {path}"),
        })
    }

    fn open_stream(&self, url: &str, range_start: u64) -> Result<RemoteStream, MlhubError> {
        self.inner.stream_opens.fetch_add(1, Ordering::Relaxed);
        if let Some(status) = self.inner.failures.lock().unwrap().get(url) {
            return Err(MlhubError::ApiStatus {
                status: *status,
                message: format!("forced failure for {url}"),
            });
        }
        let body = if url == format!("catalog/{DATASET_ID}") {
            &self.inner.archive
        } else {
            self.inner.assets.get(url).ok_or_else(|| MlhubError::ApiStatus {
                status: 404,
                message: format!("no asset {url}"),
            })?
        };
        let start = (range_start as usize).min(body.len());
        Ok(RemoteStream {
            total_len: body.len() as u64,
            reader: Box::new(Cursor::new(body[start..].to_vec())),
        })
    }
}

fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *body).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn item_json(
    id: &str,
    collection: &str,
    bbox: [f64; 4],
    datetime: &str,
    assets: &[(&str, &str)],
) -> Vec<u8> {
    let assets: serde_json::Map<String, serde_json::Value> = assets
        .iter()
        .map(|(key, href)| (key.to_string(), json!({"href": href})))
        .collect();
    json!({
        "id": id,
        "collection": collection,
        "bbox": bbox,
        "properties": {"datetime": datetime},
        "assets": assets,
    })
    .to_string()
    .into_bytes()
}

/// Two source items with B02/B04 bands, a label item with a shared
/// documentation asset, plus a collection-level readme on `source`.
fn fixture() -> MockHub {
    let source_collection = json!({
        "id": "source",
        "type": "Collection",
        "assets": {"readme": {"href": "https://hub/source/readme.pdf"}},
    })
    .to_string()
    .into_bytes();
    let labels_collection = json!({"id": "labels", "type": "Collection"})
        .to_string()
        .into_bytes();

    let archive = tar_gz(&[
        ("test_dataset/catalog.json", b"{}".as_slice()),
        ("test_dataset/source/collection.json", &source_collection),
        (
            "test_dataset/source/item_1/item_1.json",
            &item_json(
                "item_1",
                "source",
                [0.0, 0.0, 1.0, 1.0],
                "2019-05-01T00:00:00Z",
                &[
                    ("B02", "https://hub/i1/B02.tif"),
                    ("B04", "https://hub/i1/B04.tif"),
                ],
            ),
        ),
        (
            "test_dataset/source/item_2/item_2.json",
            &item_json(
                "item_2",
                "source",
                [10.0, 10.0, 11.0, 11.0],
                "2020-01-15T00:00:00Z",
                &[("B02", "https://hub/i2/B02.tif")],
            ),
        ),
        ("test_dataset/labels/collection.json", &labels_collection),
        (
            "test_dataset/labels/label_1/label_1.json",
            &item_json(
                "label_1",
                "labels",
                [0.0, 0.0, 1.0, 1.0],
                "2019-05-01T00:00:00Z",
                &[
                    ("labels", "https://hub/l1/labels.json"),
                    ("documentation", "https://hub/docs.pdf"),
                ],
            ),
        ),
    ]);

    MockHub::new(
        archive,
        &[
            ("https://hub/source/readme.pdf", b"readme".as_slice()),
            ("https://hub/i1/B02.tif", b"i1-b02"),
            ("https://hub/i1/B04.tif", b"i1-b04"),
            ("https://hub/i2/B02.tif", b"i2-b02"),
            ("https://hub/l1/labels.json", b"{\"label\":1}"),
            ("https://hub/docs.pdf", b"docs"),
        ],
    )
}

fn args(output_dir: &Utf8PathBuf) -> DownloadArgs {
    DownloadArgs {
        dataset: DATASET_ID.parse().unwrap(),
        output_dir: output_dir.clone(),
        if_exists: IfExists::Resume,
        catalog_only: false,
        concurrency: 4,
        collection_filter: None,
        temporal: None,
        bbox: None,
        intersects: None,
        retry_failed: false,
    }
}

fn out_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

#[test]
fn full_download_materializes_every_asset() {
    let dir = tempfile::tempdir().unwrap();
    let output = out_dir(&dir);
    let hub = fixture();
    let app = App::new(hub.clone());

    let summary = app
        .download(args(&output), &AtomicBool::new(false), &Quiet)
        .unwrap();

    assert_eq!(summary.discovered, 6);
    assert_eq!(summary.accepted, 6);
    assert_eq!(summary.complete, 6);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.report_path, None);

    let dataset_dir = output.join(DATASET_ID);
    assert!(dataset_dir.join("catalog.json").as_std_path().exists());
    assert_eq!(
        std::fs::read(dataset_dir.join("source/item_1/B02.tif")).unwrap(),
        b"i1-b02"
    );
    assert_eq!(
        std::fs::read(dataset_dir.join("source/readme.pdf")).unwrap(),
        b"readme"
    );
    // shared documentation asset lands once, under the collection's _common
    assert_eq!(
        std::fs::read(dataset_dir.join("labels/_common/documentation.pdf")).unwrap(),
        b"docs"
    );
    assert!(!dataset_dir.join(REPORT_FILE_NAME).as_std_path().exists());
}

#[test]
fn second_run_with_skip_touches_no_asset_urls() {
    let dir = tempfile::tempdir().unwrap();
    let output = out_dir(&dir);
    let hub = fixture();
    let app = App::new(hub.clone());

    app.download(args(&output), &AtomicBool::new(false), &Quiet)
        .unwrap();
    let after_first = hub.stream_opens();

    let mut rerun = args(&output);
    rerun.if_exists = IfExists::Skip;
    let summary = app
        .download(rerun, &AtomicBool::new(false), &Quiet)
        .unwrap();

    // completed ledger entries never re-enter the worklist
    assert_eq!(summary.complete, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.failed, 0);
    // only the archive size check hits the network on the second run
    assert_eq!(hub.stream_opens(), after_first + 1);
}

#[test]
fn collection_filter_limits_the_worklist() {
    let dir = tempfile::tempdir().unwrap();
    let output = out_dir(&dir);
    let hub = fixture();
    let app = App::new(hub.clone());

    let mut filtered = args(&output);
    let mut filter = CollectionFilter::new();
    filter.insert("source".to_string(), vec!["B02".to_string()]);
    filtered.collection_filter = Some(filter);

    let summary = app
        .download(filtered, &AtomicBool::new(false), &Quiet)
        .unwrap();

    // two B02 item assets plus the collection-level readme on source;
    // the labels collection is filtered out entirely
    assert_eq!(summary.accepted, 3);
    assert_eq!(summary.complete, 3);

    let dataset_dir = output.join(DATASET_ID);
    assert!(dataset_dir.join("source/item_1/B02.tif").as_std_path().exists());
    assert!(!dataset_dir.join("source/item_1/B04.tif").as_std_path().exists());
    assert!(!dataset_dir.join("labels").as_std_path().exists());
}

#[test]
fn bbox_filter_drops_disjoint_items() {
    let dir = tempfile::tempdir().unwrap();
    let output = out_dir(&dir);
    let hub = fixture();
    let app = App::new(hub.clone());

    let mut filtered = args(&output);
    filtered.bbox = Some(
        stac_dataset_manager::domain::BoundingBox::from_slice(&[0.5, 0.5, 2.0, 2.0]).unwrap(),
    );

    let summary = app
        .download(filtered, &AtomicBool::new(false), &Quiet)
        .unwrap();

    // item_2 is disjoint; collection-level assets ignore spatial filters
    assert_eq!(summary.accepted, 5);
    let dataset_dir = output.join(DATASET_ID);
    assert!(!dataset_dir.join("source/item_2/B02.tif").as_std_path().exists());
    assert!(dataset_dir.join("source/readme.pdf").as_std_path().exists());
}

#[test]
fn conflicting_spatial_filters_fail_before_any_network() {
    let dir = tempfile::tempdir().unwrap();
    let output = out_dir(&dir);
    let hub = fixture();
    let app = App::new(hub.clone());

    let mut conflicting = args(&output);
    conflicting.bbox = Some(
        stac_dataset_manager::domain::BoundingBox::from_slice(&[0.0, 0.0, 1.0, 1.0]).unwrap(),
    );
    conflicting.intersects = Some(json!({
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]],
    }));

    let result = app.download(conflicting, &AtomicBool::new(false), &Quiet);

    assert_matches!(result, Err(MlhubError::InvalidFilter(_)));
    assert_eq!(hub.json_calls(), 0);
    assert_eq!(hub.stream_opens(), 0);
}

#[test]
fn one_failed_asset_is_reported_and_the_rest_complete() {
    let dir = tempfile::tempdir().unwrap();
    let output = out_dir(&dir);
    let hub = fixture();
    hub.fail_url("https://hub/i1/B04.tif", 404);
    let app = App::new(hub.clone());

    let summary = app
        .download(args(&output), &AtomicBool::new(false), &Quiet)
        .unwrap();

    assert_eq!(summary.complete, 5);
    assert_eq!(summary.failed, 1);

    let dataset_dir = output.join(DATASET_ID);
    let report_path = summary.report_path.expect("failures produce a report");
    assert_eq!(report_path, dataset_dir.join(REPORT_FILE_NAME).to_string());
    let report = std::fs::read_to_string(&report_path).unwrap();
    assert!(report.contains("https://hub/i1/B04.tif"));
    assert_eq!(report.lines().count(), 2); // header plus one failure row

    // a later retry run picks the failure back up and drains it
    hub.inner.failures.lock().unwrap().clear();
    let mut retry = args(&output);
    retry.retry_failed = true;
    let summary = app
        .download(retry, &AtomicBool::new(false), &Quiet)
        .unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.complete, 1);
    assert_eq!(summary.skipped, 0);
    assert!(!dataset_dir.join(REPORT_FILE_NAME).as_std_path().exists());
    assert!(dataset_dir.join("source/item_1/B04.tif").as_std_path().exists());
}

#[test]
fn catalog_only_unpacks_without_downloading_assets() {
    let dir = tempfile::tempdir().unwrap();
    let output = out_dir(&dir);
    let hub = fixture();
    let app = App::new(hub.clone());

    let mut catalog_only = args(&output);
    catalog_only.catalog_only = true;
    let summary = app
        .download(catalog_only, &AtomicBool::new(false), &Quiet)
        .unwrap();

    assert!(summary.catalog_only);
    assert_eq!(summary.complete, 0);

    let dataset_dir = output.join(DATASET_ID);
    assert!(dataset_dir.join("catalog.json").as_std_path().exists());
    assert!(dataset_dir.join("source/item_1/item_1.json").as_std_path().exists());
    assert!(!dataset_dir.join("source/item_1/B02.tif").as_std_path().exists());
    // one stream open for the archive, none for assets
    assert_eq!(hub.stream_opens(), 1);
}
