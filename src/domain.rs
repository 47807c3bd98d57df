use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MlhubError;

/// Behavior when an asset's destination file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    Resume,
    Skip,
    Overwrite,
}

impl fmt::Display for IfExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfExists::Resume => write!(f, "resume"),
            IfExists::Skip => write!(f, "skip"),
            IfExists::Overwrite => write!(f, "overwrite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Doi(String);

impl Doi {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Doi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Doi {
    type Err = MlhubError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let pattern = Regex::new(r"^10\.\d{4,9}/\S+$").map_err(|err| {
            MlhubError::InvalidDoi(format!("{trimmed}: {err}"))
        })?;
        if !pattern.is_match(trimmed) {
            return Err(MlhubError::InvalidDoi(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Identifies a dataset by its catalog id or by DOI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetRef {
    Id(String),
    Doi(Doi),
}

impl DatasetRef {
    pub fn as_str(&self) -> &str {
        match self {
            DatasetRef::Id(id) => id,
            DatasetRef::Doi(doi) => doi.as_str(),
        }
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DatasetRef {
    type Err = MlhubError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(MlhubError::InvalidDatasetRef(value.to_string()));
        }
        if trimmed.starts_with("10.") {
            return Ok(DatasetRef::Doi(trimmed.parse()?));
        }
        Ok(DatasetRef::Id(trimmed.to_string()))
    }
}

/// WGS84 bounding box: west, south, east, north.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn from_slice(values: &[f64]) -> Result<Self, MlhubError> {
        match values {
            [west, south, east, north] => {
                let bbox = Self {
                    west: *west,
                    south: *south,
                    east: *east,
                    north: *north,
                };
                if bbox.west > bbox.east || bbox.south > bbox.north {
                    return Err(MlhubError::InvalidBbox(format!(
                        "degenerate extent: {values:?}"
                    )));
                }
                Ok(bbox)
            }
            _ => Err(MlhubError::InvalidBbox(format!(
                "expected 4 values, got {}",
                values.len()
            ))),
        }
    }

    /// Rectangle overlap test, inclusive of shared edges.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }

    pub fn to_rect(&self) -> geo::Rect<f64> {
        geo::Rect::new(
            geo::coord! { x: self.west, y: self.south },
            geo::coord! { x: self.east, y: self.north },
        )
    }
}

/// Temporal constraint: a single day or a closed interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TemporalQuery {
    Instant(DateTime<Utc>),
    Range(DateTime<Utc>, DateTime<Utc>),
}

impl TemporalQuery {
    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, MlhubError> {
        if start > end {
            return Err(MlhubError::InvalidDatetime(format!(
                "range start {start} is after end {end}"
            )));
        }
        Ok(TemporalQuery::Range(start, end))
    }
}

pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>, MlhubError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|err| MlhubError::InvalidDatetime(format!("{value}: {err}")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| MlhubError::InvalidDatetime(value.to_string()))?;
    Ok(DateTime::from_naive_utc_and_offset(midnight, Utc))
}

/// Parse a `--datetime` argument: a single date or `start/end`.
pub fn parse_temporal_query(value: &str) -> Result<TemporalQuery, MlhubError> {
    match value.split_once('/') {
        Some((start, end)) => {
            TemporalQuery::range(parse_datetime(start)?, parse_datetime(end)?)
        }
        None => Ok(TemporalQuery::Instant(parse_datetime(value)?)),
    }
}

/// Ledger identity of one downloadable asset.
///
/// Collection-level assets carry no item id; common assets are keyed under
/// the shared `_common` slot so multiple referencing items collapse to one
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetIdentity {
    pub collection_id: String,
    pub item_id: Option<String>,
    pub asset_key: String,
}

impl AssetIdentity {
    pub fn ledger_key(&self) -> String {
        match &self.item_id {
            Some(item_id) => format!("{}/{item_id}/{}", self.collection_id, self.asset_key),
            None => format!("{}//{}", self.collection_id, self.asset_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_dataset_ref_id() {
        let dataset: DatasetRef = "bigearthnet_v1".parse().unwrap();
        assert_matches!(dataset, DatasetRef::Id(id) if id == "bigearthnet_v1");
    }

    #[test]
    fn parse_dataset_ref_doi() {
        let dataset: DatasetRef = "10.6084/m9.figshare.12047478.v2".parse().unwrap();
        assert_matches!(dataset, DatasetRef::Doi(_));
    }

    #[test]
    fn parse_dataset_ref_invalid_doi() {
        let err = "10.bad".parse::<DatasetRef>().unwrap_err();
        assert_matches!(err, MlhubError::InvalidDoi(_));
    }

    #[test]
    fn bbox_intersection() {
        let a = BoundingBox::from_slice(&[0.0, 0.0, 10.0, 10.0]).unwrap();
        let b = BoundingBox::from_slice(&[5.0, 5.0, 15.0, 15.0]).unwrap();
        let c = BoundingBox::from_slice(&[20.0, 20.0, 30.0, 30.0]).unwrap();
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn bbox_edge_touch_counts_as_overlap() {
        let a = BoundingBox::from_slice(&[0.0, 0.0, 10.0, 10.0]).unwrap();
        let b = BoundingBox::from_slice(&[10.0, 0.0, 20.0, 10.0]).unwrap();
        assert!(a.intersects(&b));
    }

    #[test]
    fn bbox_rejects_bad_arity() {
        let err = BoundingBox::from_slice(&[0.0, 1.0]).unwrap_err();
        assert_matches!(err, MlhubError::InvalidBbox(_));
    }

    #[test]
    fn temporal_query_parse() {
        let instant = parse_temporal_query("2019-04-01").unwrap();
        assert_matches!(instant, TemporalQuery::Instant(_));

        let range = parse_temporal_query("2019-04-01/2019-06-30").unwrap();
        assert_matches!(range, TemporalQuery::Range(start, end) if start < end);

        let err = parse_temporal_query("2019-06-30/2019-04-01").unwrap_err();
        assert_matches!(err, MlhubError::InvalidDatetime(_));
    }

    #[test]
    fn ledger_key_shapes() {
        let item_scoped = AssetIdentity {
            collection_id: "source".to_string(),
            item_id: Some("tile_1".to_string()),
            asset_key: "B02".to_string(),
        };
        assert_eq!(item_scoped.ledger_key(), "source/tile_1/B02");

        let collection_scoped = AssetIdentity {
            collection_id: "labels".to_string(),
            item_id: None,
            asset_key: "documentation".to_string(),
        };
        assert_eq!(collection_scoped.ledger_key(), "labels//documentation");
    }
}
