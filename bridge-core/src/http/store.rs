//! The local document store, addressed as a CouchDB-style HTTP database:
//! `get`/`put` are revision-checked, `exists`/`create` manage the database
//! itself. A different store could implement the same operations
//! differently.

use reqwest::StatusCode;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::model::{doc_date_modified, LocalRecord, ResourceDocument, Revision};
use crate::stats::StatsRecord;

pub struct StoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl StoreClient {
    pub fn new(http: reqwest::Client, couch_url: &str) -> Self {
        Self {
            http,
            base_url: couch_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn exists(&self, database_name: &str) -> Result<bool, StoreError> {
        let resp = self
            .http
            .head(format!("{}/{}", self.base_url, database_name))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    pub async fn create(&self, database_name: &str) -> Result<(), StoreError> {
        let resp = self
            .http
            .put(format!("{}/{}", self.base_url, database_name))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::PRECONDITION_FAILED => Ok(()), // already exists
            s => Err(StoreError::Unavailable(s.as_u16())),
        }
    }

    pub async fn get(&self, database_name: &str, id: &str) -> Result<Option<LocalRecord>, StoreError> {
        let resp = self
            .http
            .get(format!("{}/{}/{}", self.base_url, database_name, id))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let mut doc: Value = resp.json().await.map_err(|e| StoreError::Malformed(e.to_string()))?;
                let revision = take_rev(&mut doc).unwrap_or_default();
                Ok(Some(LocalRecord { doc, revision: Revision(revision) }))
            }
            s => Err(StoreError::Unavailable(s.as_u16())),
        }
    }

    /// Revision-checked write: `revision = None` means insert, `Some` means
    /// update preserving optimistic concurrency. Returns the new revision,
    /// or `StoreError::Conflict` if `revision` is stale.
    pub async fn put(
        &self,
        database_name: &str,
        id: &str,
        doc: &ResourceDocument,
        revision: Option<&Revision>,
    ) -> Result<Revision, StoreError> {
        let mut body = doc.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("_id".into(), Value::String(id.to_string()));
            if let Some(rev) = revision {
                obj.insert("_rev".into(), Value::String(rev.0.clone()));
            }
        }

        let resp = self
            .http
            .put(format!("{}/{}/{}", self.base_url, database_name, id))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => {
                let out: Value = resp.json().await.map_err(|e| StoreError::Malformed(e.to_string()))?;
                let rev = out.get("rev").and_then(Value::as_str).unwrap_or_default().to_string();
                Ok(Revision(rev))
            }
            StatusCode::CONFLICT => Err(StoreError::Conflict),
            s => Err(StoreError::Unavailable(s.as_u16())),
        }
    }

    /// Fire-and-forget: errors are logged by the caller and swallowed.
    pub async fn save_stats(&self, logs_db: &str, record: &StatsRecord) -> Result<(), StoreError> {
        self.http
            .post(format!("{}/{}", self.base_url, logs_db))
            .json(record)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(())
    }
}

fn take_rev(doc: &mut Value) -> Option<String> {
    let obj: &mut Map<String, Value> = doc.as_object_mut()?;
    obj.remove("_rev")?.as_str().map(str::to_string)
}

/// Returns the stored `dateModified` for `id`, or `None` if absent.
/// Used only by the staleness filter, which never needs the full document.
pub async fn stored_date_modified(
    store: &StoreClient,
    database_name: &str,
    id: &str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, StoreError> {
    let record = store.get(database_name, id).await?;
    Ok(record.and_then(|r| doc_date_modified(&r.doc)))
}
