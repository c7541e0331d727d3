//! Wire and storage shapes shared by every component of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An advertised version of a resource, as produced by the changes feed.
///
/// Immutable once enqueued, except for `attempt`, which accumulates across
/// re-enqueues into the retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    #[serde(rename = "dateModified")]
    pub date_modified: DateTime<Utc>,
    #[serde(skip, default)]
    pub attempt: u32,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>, date_modified: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            date_modified,
            attempt: 0,
        }
    }
}

/// One page of the upstream `?mode=_all_` changes feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangesPage {
    pub data: Vec<ResourceRef>,
    #[serde(default)]
    pub next_page: NextPage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NextPage {
    pub offset: Option<String>,
}

/// An opaque resource document. The bridge never inspects anything beyond
/// `id` and `dateModified`; everything else is carried through verbatim.
pub type ResourceDocument = serde_json::Value;

/// Extracts the `dateModified` field the bridge is allowed to look at.
pub fn doc_date_modified(doc: &ResourceDocument) -> Option<DateTime<Utc>> {
    doc.get("dateModified")?.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc))
}

/// Store-assigned optimistic-concurrency token (CouchDB `_rev`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision(pub String);

/// The stored form of a `ResourceDocument`, keyed by `id` at the store layer.
#[derive(Debug, Clone)]
pub struct LocalRecord {
    pub doc: ResourceDocument,
    pub revision: Revision,
}
