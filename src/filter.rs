use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use geo::{BoundingRect, Intersects};
use tracing::warn;

use crate::domain::{BoundingBox, TemporalQuery};
use crate::error::MlhubError;

/// Allow-list of collection ids, each with a set of allowed asset keys.
/// An empty key list admits no item asset from that collection.
pub type CollectionFilter = BTreeMap<String, Vec<String>>;

/// Temporal and spatial context of one catalog item, captured once at
/// materialization time.
#[derive(Debug, Clone, Default)]
pub struct ItemSummary {
    pub bbox: Option<BoundingBox>,
    pub datetime: Option<DateTime<Utc>>,
    pub start_datetime: Option<DateTime<Utc>>,
    pub end_datetime: Option<DateTime<Utc>>,
}

/// The set of active download filters. Pure and read-only once built, so it
/// can be shared across worker threads without synchronization.
#[derive(Debug, Default)]
pub struct FilterSet {
    pub collections: Option<CollectionFilter>,
    pub temporal: Option<TemporalQuery>,
    pub bbox: Option<BoundingBox>,
    pub intersects: Option<geo::Geometry<f64>>,
}

impl FilterSet {
    pub fn new(
        collections: Option<CollectionFilter>,
        temporal: Option<TemporalQuery>,
        bbox: Option<BoundingBox>,
        intersects: Option<geo::Geometry<f64>>,
    ) -> Result<Self, MlhubError> {
        if bbox.is_some() && intersects.is_some() {
            return Err(MlhubError::InvalidFilter(
                "provide either bbox or intersects, not both".to_string(),
            ));
        }
        Ok(Self {
            collections,
            temporal,
            bbox,
            intersects,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_none()
            && self.temporal.is_none()
            && self.bbox.is_none()
            && self.intersects.is_none()
    }

    /// Decide inclusion of one asset. Filters combine with logical AND;
    /// an absent filter category imposes no constraint.
    ///
    /// `item` is `None` for collection-level assets, which carry no
    /// spatial or temporal properties and are only subject to the
    /// collection allow-list.
    pub fn accepts(&self, item: Option<&ItemSummary>, collection_id: &str, asset_key: &str) -> bool {
        if let Some(collections) = &self.collections {
            let Some(allowed_keys) = collections.get(collection_id) else {
                return false;
            };
            if item.is_some() && !allowed_keys.iter().any(|key| key == asset_key) {
                return false;
            }
        }

        let Some(item) = item else {
            return true;
        };

        if let Some(temporal) = &self.temporal {
            if !temporal_accepts(temporal, item, collection_id) {
                return false;
            }
        }

        if let Some(query_bbox) = &self.bbox {
            let Some(item_bbox) = &item.bbox else {
                warn!(collection_id, "item missing bbox, excluded by bbox filter");
                return false;
            };
            if !query_bbox.intersects(item_bbox) {
                return false;
            }
        }

        if let Some(geometry) = &self.intersects {
            let Some(item_bbox) = &item.bbox else {
                warn!(
                    collection_id,
                    "item missing bbox, excluded by intersects filter"
                );
                return false;
            };
            if !geometry_intersects_bbox(geometry, item_bbox) {
                return false;
            }
        }

        true
    }
}

fn temporal_accepts(query: &TemporalQuery, item: &ItemSummary, collection_id: &str) -> bool {
    if let Some(single) = item.datetime {
        return match query {
            // instant-to-instant comparison is at day granularity
            TemporalQuery::Instant(instant) => single.date_naive() == instant.date_naive(),
            TemporalQuery::Range(start, end) => single >= *start && single <= *end,
        };
    }
    match (item.start_datetime, item.end_datetime) {
        (Some(item_start), Some(item_end)) => match query {
            TemporalQuery::Instant(instant) => *instant >= item_start && *instant <= item_end,
            TemporalQuery::Range(start, end) => item_start <= *end && item_end >= *start,
        },
        _ => {
            warn!(
                collection_id,
                "item missing datetime, excluded by temporal filter"
            );
            false
        }
    }
}

/// Cheap bounding-rect pre-test, then the precise polygon intersection.
/// The item side is always its bbox, not its full geometry.
fn geometry_intersects_bbox(geometry: &geo::Geometry<f64>, item_bbox: &BoundingBox) -> bool {
    let item_rect = item_bbox.to_rect();
    if let Some(query_rect) = geometry.bounding_rect() {
        let query_bbox = BoundingBox {
            west: query_rect.min().x,
            south: query_rect.min().y,
            east: query_rect.max().x,
            north: query_rect.max().y,
        };
        if !query_bbox.intersects(item_bbox) {
            return false;
        }
    }
    geometry.intersects(&item_rect.to_polygon())
}

/// Parse an intersects argument: a GeoJSON geometry, or a feature wrapping
/// one (the `geometry` member is required in that case).
pub fn parse_intersects(value: &serde_json::Value) -> Result<geo::Geometry<f64>, MlhubError> {
    let geojson = geojson::GeoJson::from_json_value(value.clone())
        .map_err(|err| MlhubError::InvalidFilter(format!("intersects is not GeoJSON: {err}")))?;
    let geometry = match geojson {
        geojson::GeoJson::Geometry(geometry) => geometry,
        geojson::GeoJson::Feature(feature) => feature.geometry.ok_or_else(|| {
            MlhubError::InvalidFilter(
                "intersects feature has no geometry property".to_string(),
            )
        })?,
        geojson::GeoJson::FeatureCollection(_) => {
            return Err(MlhubError::InvalidFilter(
                "intersects must be a single geometry or feature".to_string(),
            ));
        }
    };
    geo::Geometry::<f64>::try_from(&geometry)
        .map_err(|err| MlhubError::InvalidFilter(format!("unsupported geometry: {err}")))
}
