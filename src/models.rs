use serde::{Deserialize, Serialize};

use crate::domain::{DatasetRef, Doi};
use crate::error::MlhubError;
use crate::session::ApiSession;

/// Typed view of one dataset as returned by the catalog API.
///
/// Decoding is strict at this boundary: a response missing required fields
/// fails here instead of surfacing as a panic deeper in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub collections: Vec<DatasetCollection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetCollection {
    pub id: String,
    #[serde(default)]
    pub types: Vec<String>,
}

/// Archive availability for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub collection: String,
    pub dataset: String,
    pub size: u64,
}

pub fn fetch_dataset(
    session: &dyn ApiSession,
    dataset: &DatasetRef,
) -> Result<Dataset, MlhubError> {
    match dataset {
        DatasetRef::Id(id) => fetch_dataset_by_id(session, id),
        DatasetRef::Doi(doi) => fetch_dataset_by_doi(session, doi),
    }
}

pub fn fetch_dataset_by_id(session: &dyn ApiSession, id: &str) -> Result<Dataset, MlhubError> {
    let value = map_not_found(session.get_json(&format!("datasets/{id}"), &[]), id)?;
    decode_dataset(value)
}

pub fn fetch_dataset_by_doi(session: &dyn ApiSession, doi: &Doi) -> Result<Dataset, MlhubError> {
    let value = map_not_found(
        session.get_json(&format!("datasets/doi/{doi}"), &[]),
        doi.as_str(),
    )?;
    decode_dataset(value)
}

/// Archive info for a collection, or `None` when no archive is published.
pub fn collection_archive_info(
    session: &dyn ApiSession,
    collection_id: &str,
) -> Result<Option<ArchiveInfo>, MlhubError> {
    match session.get_json(&format!("archive/{collection_id}/info"), &[]) {
        Ok(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|err| MlhubError::ApiDecode(err.to_string())),
        Err(MlhubError::ApiStatus { status: 404, .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

fn map_not_found(
    result: Result<serde_json::Value, MlhubError>,
    reference: &str,
) -> Result<serde_json::Value, MlhubError> {
    match result {
        Err(MlhubError::ApiStatus { status: 404, .. }) => {
            Err(MlhubError::DatasetNotFound(reference.to_string()))
        }
        other => other,
    }
}

fn decode_dataset(value: serde_json::Value) -> Result<Dataset, MlhubError> {
    serde_json::from_value(value).map_err(|err| MlhubError::ApiDecode(err.to_string()))
}

/// Lazy, restartable page-by-page listing of datasets.
///
/// Each `next()` call serves from the buffered page and fetches at most one
/// further page from the API. Ordering across pages is the remote side's
/// responsibility.
pub struct DatasetPages<'a> {
    session: &'a dyn ApiSession,
    params: Vec<(&'static str, String)>,
    buffered: std::vec::IntoIter<serde_json::Value>,
    next_page: Option<String>,
    done: bool,
}

impl<'a> DatasetPages<'a> {
    pub fn new(session: &'a dyn ApiSession, tags: &[String], text: &[String]) -> Self {
        let mut params = Vec::new();
        for tag in tags {
            params.push(("tags", tag.clone()));
        }
        for phrase in text {
            params.push(("text", phrase.clone()));
        }
        Self {
            session,
            params,
            buffered: Vec::new().into_iter(),
            next_page: Some("datasets".to_string()),
            done: false,
        }
    }

    fn fetch_next_page(&mut self) -> Result<(), MlhubError> {
        let Some(page_url) = self.next_page.take() else {
            self.done = true;
            return Ok(());
        };
        let value = self.session.get_json(&page_url, &self.params)?;

        // The API serves either a bare array or a paged object with
        // `features` plus a rel=next link.
        let (items, next) = match value {
            serde_json::Value::Array(items) => (items, None),
            serde_json::Value::Object(mut obj) => {
                let items = match obj.remove("features") {
                    Some(serde_json::Value::Array(items)) => items,
                    _ => {
                        return Err(MlhubError::ApiDecode(
                            "dataset page has no features array".to_string(),
                        ));
                    }
                };
                let next = obj
                    .get("links")
                    .and_then(|links| links.as_array())
                    .and_then(|links| {
                        links.iter().find(|link| {
                            link.get("rel").and_then(|rel| rel.as_str()) == Some("next")
                        })
                    })
                    .and_then(|link| link.get("href"))
                    .and_then(|href| href.as_str())
                    .map(|href| href.to_string());
                (items, next)
            }
            _ => {
                return Err(MlhubError::ApiDecode(
                    "unexpected dataset listing shape".to_string(),
                ));
            }
        };

        self.next_page = next;
        if self.next_page.is_none() {
            self.done = true;
        }
        self.buffered = items.into_iter();
        Ok(())
    }
}

impl Iterator for DatasetPages<'_> {
    type Item = Result<Dataset, MlhubError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.buffered.next() {
                return Some(decode_dataset(value));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fetch_next_page() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}
