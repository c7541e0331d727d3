//! The staleness filter: the admission gate between the changes feed and
//! the primary queue. Fails open: a store error admits the item rather
//! than stalling the pipeline, at the cost of a redundant fetch.

use tracing::warn;

use crate::http::store::stored_date_modified;
use crate::http::StoreClient;
use crate::model::ResourceRef;
use crate::stats::Stats;

pub enum Admission {
    Admit,
    Drop,
}

/// Admits `ref` if the store has no record for it, or the stored
/// `dateModified` is older than the advertised one. Any store error admits
/// (fail-open) and bumps `exceptions`.
pub async fn check(store: &StoreClient, database_name: &str, item: &ResourceRef, stats: &Stats) -> Admission {
    match stored_date_modified(store, database_name, &item.id).await {
        Ok(Some(stored)) if stored >= item.date_modified => {
            stats.inc_skipped();
            Admission::Drop
        }
        Ok(_) => Admission::Admit,
        Err(e) => {
            warn!(id = %item.id, error = %e, "staleness filter: store read failed, admitting fail-open");
            stats.inc_exceptions();
            Admission::Admit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_against(server: &MockServer) -> StoreClient {
        StoreClient::new(reqwest::Client::new(), &server.uri())
    }

    #[tokio::test]
    async fn admits_when_record_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
        let store = store_against(&server).await;
        let stats = Stats::new();
        let item = ResourceRef::new("a", Utc::now());
        assert!(matches!(check(&store, "db", &item, &stats).await, Admission::Admit));
    }

    #[tokio::test]
    async fn drops_when_stored_is_newer_or_equal() {
        let server = MockServer::start().await;
        let now = Utc::now();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "a", "dateModified": now.to_rfc3339(), "_rev": "1-x"
            })))
            .mount(&server)
            .await;
        let store = store_against(&server).await;
        let stats = Stats::new();
        let item = ResourceRef::new("a", now - ChronoDuration::seconds(1));
        assert!(matches!(check(&store, "db", &item, &stats).await, Admission::Drop));
    }

    #[tokio::test]
    async fn admits_when_stored_is_older() {
        let server = MockServer::start().await;
        let now = Utc::now();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "a", "dateModified": (now - ChronoDuration::seconds(5)).to_rfc3339(), "_rev": "1-x"
            })))
            .mount(&server)
            .await;
        let store = store_against(&server).await;
        let stats = Stats::new();
        let item = ResourceRef::new("a", now);
        assert!(matches!(check(&store, "db", &item, &stats).await, Admission::Admit));
    }
}
