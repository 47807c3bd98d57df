use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::{AssetIdentity, BoundingBox, IfExists};
use crate::download::ResumableDownloader;
use crate::error::MlhubError;
use crate::filter::{FilterSet, ItemSummary};
use crate::ledger::{AssetLedger, LEDGER_DIR_NAME};
use crate::report::REPORT_FILE_NAME;
use crate::session::ApiSession;

/// Asset keys shared identically across many items; they land in the
/// collection's `_common` directory and are downloaded once.
pub const COMMON_ASSET_KEYS: [&str; 5] = [
    "documentation",
    "readme",
    "test_split",
    "train_split",
    "validation_split",
];

/// Fast-path extensions checked before falling back to URL parsing.
const KNOWN_EXTENSIONS: [&str; 8] = [
    ".tiff", ".tif", ".json", ".pdf", ".png", ".jpeg", ".jpg", ".csv",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct MaterializeCounts {
    /// Assets discovered in the catalog tree.
    pub discovered: usize,
    /// Assets that passed the active filters and entered the ledger.
    pub accepted: usize,
    /// Items skipped because their JSON was malformed.
    pub skipped_items: usize,
}

/// Turns a remote dataset catalog into a populated asset ledger: fetches the
/// compact archive, unpacks it, walks the item tree and upserts one pending
/// ledger entry per accepted asset.
pub struct Materializer<'a> {
    session: &'a dyn ApiSession,
    dataset_id: String,
    output_dir: Utf8PathBuf,
    if_exists: IfExists,
}

impl<'a> Materializer<'a> {
    pub fn new(
        session: &'a dyn ApiSession,
        dataset_id: &str,
        output_dir: &Utf8Path,
        if_exists: IfExists,
    ) -> Self {
        Self {
            session,
            dataset_id: dataset_id.to_string(),
            output_dir: output_dir.to_path_buf(),
            if_exists,
        }
    }

    pub fn dataset_dir(&self) -> Utf8PathBuf {
        self.output_dir.join(&self.dataset_id)
    }

    pub fn archive_path(&self) -> Utf8PathBuf {
        self.output_dir.join(format!("{}.tar.gz", self.dataset_id))
    }

    /// Fetch and unpack the catalog archive. Fatal on fetch failure or a
    /// corrupt archive; there is no usable partial catalog.
    pub fn fetch_and_unpack(&self) -> Result<(), MlhubError> {
        fs::create_dir_all(self.dataset_dir().as_std_path())
            .map_err(|err| MlhubError::Filesystem(err.to_string()))?;

        let archive_path = self.archive_path();
        // The archive shares the asset resume algorithm: size-match skips the
        // fetch, a shorter local file resumes from its current length. Skip
        // mode would leave a half-fetched archive in place, so it maps to
        // resume here.
        let archive_mode = match self.if_exists {
            IfExists::Overwrite => IfExists::Overwrite,
            IfExists::Skip | IfExists::Resume => IfExists::Resume,
        };
        info!(dataset_id = self.dataset_id, "fetching catalog archive");
        ResumableDownloader::new(
            self.session,
            &format!("catalog/{}", self.dataset_id),
            archive_path.as_std_path(),
            archive_mode,
        )
        .run()
        .map_err(|err| MlhubError::CatalogFetch(err.to_string()))?;

        info!(archive = %archive_path, "unpacking catalog archive");
        self.unpack(archive_path.as_std_path())?;

        if !self.dataset_dir().join("catalog.json").as_std_path().exists() {
            return Err(MlhubError::CatalogCorrupt(format!(
                "{archive_path} did not contain {}/catalog.json",
                self.dataset_id
            )));
        }
        Ok(())
    }

    fn unpack(&self, archive_path: &Path) -> Result<(), MlhubError> {
        let file = fs::File::open(archive_path)
            .map_err(|err| MlhubError::CatalogCorrupt(format!("open archive: {err}")))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let entries = archive
            .entries()
            .map_err(|err| MlhubError::CatalogCorrupt(err.to_string()))?;
        for entry in entries {
            let mut entry = entry.map_err(|err| MlhubError::CatalogCorrupt(err.to_string()))?;
            let entry_path = entry
                .path()
                .map_err(|err| MlhubError::CatalogCorrupt(err.to_string()))?
                .into_owned();
            if self.if_exists != IfExists::Overwrite
                && self.output_dir.as_std_path().join(&entry_path).exists()
            {
                continue;
            }
            // unpack_in refuses paths escaping the output directory
            let unpacked = entry
                .unpack_in(self.output_dir.as_std_path())
                .map_err(|err| MlhubError::CatalogCorrupt(err.to_string()))?;
            if !unpacked {
                return Err(MlhubError::CatalogCorrupt(format!(
                    "archive entry escapes output directory: {}",
                    entry_path.display()
                )));
            }
        }
        Ok(())
    }

    /// Walk the unpacked tree once and populate the ledger with every asset
    /// that passes the active filters. Entries already `Complete` or
    /// `Failed` from an earlier run are left untouched.
    pub fn build_worklist(
        &self,
        ledger: &AssetLedger,
        filters: &FilterSet,
    ) -> Result<MaterializeCounts, MlhubError> {
        let mut counts = MaterializeCounts::default();
        let dataset_dir = self.dataset_dir();

        for json_path in json_files(dataset_dir.as_std_path())? {
            let file_name = json_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            if file_name == "catalog.json" {
                continue;
            }
            let content = match fs::read_to_string(&json_path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %json_path.display(), error = %err, "unreadable catalog file, skipped");
                    counts.skipped_items += 1;
                    continue;
                }
            };
            let value: serde_json::Value = match serde_json::from_str(&content) {
                Ok(value) => value,
                Err(err) => {
                    warn!(path = %json_path.display(), error = %err, "malformed catalog file, skipped");
                    counts.skipped_items += 1;
                    continue;
                }
            };

            let is_collection = file_name == "collection.json"
                || value.get("type").and_then(|t| t.as_str()) == Some("Collection");
            if is_collection {
                match serde_json::from_value::<StacCollection>(value) {
                    Ok(collection) => {
                        self.record_collection(ledger, filters, &collection, &mut counts)?
                    }
                    Err(err) => {
                        warn!(path = %json_path.display(), error = %err, "malformed collection, skipped");
                        counts.skipped_items += 1;
                    }
                }
            } else {
                match serde_json::from_value::<StacItem>(value) {
                    Ok(item) => self.record_item(ledger, filters, &item, &mut counts)?,
                    Err(err) => {
                        warn!(path = %json_path.display(), error = %err, "malformed item, skipped");
                        counts.skipped_items += 1;
                    }
                }
            }
        }

        info!(
            discovered = counts.discovered,
            accepted = counts.accepted,
            "catalog worklist built"
        );
        if counts.accepted == 0 && !filters.is_empty() {
            return Err(MlhubError::EmptyWorklist(self.dataset_id.clone()));
        }
        ledger.flush()?;
        Ok(counts)
    }

    fn record_item(
        &self,
        ledger: &AssetLedger,
        filters: &FilterSet,
        item: &StacItem,
        counts: &mut MaterializeCounts,
    ) -> Result<(), MlhubError> {
        let summary = item.summary();
        for (asset_key, asset) in &item.assets {
            counts.discovered += 1;
            if !filters.accepts(Some(&summary), &item.collection, asset_key) {
                continue;
            }
            let Some(ext) = asset_extension(&asset.href) else {
                warn!(
                    item_id = item.id,
                    asset_key, "asset href has no file extension, skipped"
                );
                continue;
            };
            let common = COMMON_ASSET_KEYS.contains(&asset_key.as_str());
            let (identity, save_path) = if common {
                (
                    AssetIdentity {
                        collection_id: item.collection.clone(),
                        item_id: None,
                        asset_key: asset_key.clone(),
                    },
                    format!("{}/_common/{asset_key}{ext}", item.collection),
                )
            } else {
                (
                    AssetIdentity {
                        collection_id: item.collection.clone(),
                        item_id: Some(item.id.clone()),
                        asset_key: asset_key.clone(),
                    },
                    format!("{}/{}/{asset_key}{ext}", item.collection, item.id),
                )
            };
            ledger.upsert(identity, &asset.href, &save_path, None)?;
            counts.accepted += 1;
        }
        Ok(())
    }

    fn record_collection(
        &self,
        ledger: &AssetLedger,
        filters: &FilterSet,
        collection: &StacCollection,
        counts: &mut MaterializeCounts,
    ) -> Result<(), MlhubError> {
        for (asset_key, asset) in &collection.assets {
            counts.discovered += 1;
            if !filters.accepts(None, &collection.id, asset_key) {
                continue;
            }
            let Some(ext) = asset_extension(&asset.href) else {
                warn!(
                    collection_id = collection.id,
                    asset_key, "asset href has no file extension, skipped"
                );
                continue;
            };
            let identity = AssetIdentity {
                collection_id: collection.id.clone(),
                item_id: None,
                asset_key: asset_key.clone(),
            };
            let save_path = format!("{}/{asset_key}{ext}", collection.id);
            ledger.upsert(identity, &asset.href, &save_path, None)?;
            counts.accepted += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StacItem {
    id: String,
    collection: String,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
    #[serde(default)]
    properties: ItemProperties,
    assets: BTreeMap<String, StacAsset>,
}

#[derive(Debug, Default, Deserialize)]
struct ItemProperties {
    #[serde(default)]
    datetime: Option<String>,
    #[serde(default)]
    start_datetime: Option<String>,
    #[serde(default)]
    end_datetime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StacCollection {
    id: String,
    #[serde(default)]
    assets: BTreeMap<String, StacAsset>,
}

#[derive(Debug, Deserialize)]
struct StacAsset {
    href: String,
}

impl StacItem {
    /// Capture the spatial and temporal context once; malformed values
    /// degrade to `None` and are handled by the filter engine.
    fn summary(&self) -> ItemSummary {
        let bbox = self.bbox.as_deref().and_then(|values| {
            match BoundingBox::from_slice(values) {
                Ok(bbox) => Some(bbox),
                Err(_) => {
                    warn!(item_id = self.id, "item has malformed bbox");
                    None
                }
            }
        });
        ItemSummary {
            bbox,
            datetime: parse_lenient(self.properties.datetime.as_deref()),
            start_datetime: parse_lenient(self.properties.start_datetime.as_deref()),
            end_datetime: parse_lenient(self.properties.end_datetime.as_deref()),
        }
    }
}

fn parse_lenient(value: Option<&str>) -> Option<DateTime<Utc>> {
    crate::domain::parse_datetime(value?).ok()
}

/// File extension for an asset href, dot included. Checks a fast-path list
/// first, then parses the URL path.
pub fn asset_extension(url: &str) -> Option<String> {
    for ext in KNOWN_EXTENSIONS {
        if url.contains(ext) {
            return Some(ext.to_string());
        }
    }
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let file_name = without_query.rsplit('/').next()?;
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(format!(".{ext}")),
        _ => None,
    }
}

/// Recursively collect `*.json` files, leaving the ledger store and any
/// error report out of the walk.
fn json_files(root: &Path) -> Result<Vec<PathBuf>, MlhubError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            fs::read_dir(&dir).map_err(|err| MlhubError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| MlhubError::Filesystem(err.to_string()))?;
            let path = entry.path();
            let name = entry.file_name();
            if path.is_dir() {
                if name != LEDGER_DIR_NAME {
                    stack.push(path);
                }
            } else if path.extension().map(|ext| ext == "json").unwrap_or(false)
                && name != REPORT_FILE_NAME
            {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
