//! One upstream session: fetch a changes-feed page, fetch a resource by id.

use std::time::Duration;

use reqwest::StatusCode;
use uuid::Uuid;

use crate::error::FetchError;
use crate::model::{ChangesPage, ResourceDocument};

/// A single upstream HTTP session, rotated through the client pool.
#[derive(Debug)]
pub struct ApiClient {
    pub http: reqwest::Client,
    pub user_agent: String,
    pub request_interval: Duration,
    consecutive_successes: u32,
    last_cookie: Option<String>,
    cookie_hits: u32,
}

/// After this many consecutive successful calls on one client, its pacing
/// interval is reduced by `client_dec_step_timeout`.
const SUCCESS_STREAK_FOR_DEC_STEP: u32 = 10;

impl ApiClient {
    pub fn new(user_agent_prefix: &str, timeout: Duration) -> Result<Self, FetchError> {
        let user_agent = format!("{user_agent_prefix}-{}", Uuid::new_v4());
        let http = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            user_agent,
            request_interval: Duration::ZERO,
            consecutive_successes: 0,
            last_cookie: None,
            cookie_hits: 0,
        })
    }

    /// Updates pacing and cookie-stickiness bookkeeping after one request.
    /// Returns `true` if the client should be retired (cookie stuck).
    pub fn record_response(
        &mut self,
        success: bool,
        cookie: Option<String>,
        inc_step: Duration,
        dec_step: Duration,
        cookie_threshold: u32,
    ) -> bool {
        if success {
            self.consecutive_successes += 1;
            if self.consecutive_successes >= SUCCESS_STREAK_FOR_DEC_STEP {
                self.request_interval = self.request_interval.saturating_sub(dec_step);
                self.consecutive_successes = 0;
            }
        } else {
            self.request_interval += inc_step;
            self.consecutive_successes = 0;
        }

        match (&self.last_cookie, &cookie) {
            (Some(prev), Some(new)) if prev == new => self.cookie_hits += 1,
            _ => {
                self.cookie_hits = 0;
                self.last_cookie = cookie;
            }
        }
        cookie_threshold > 0 && self.cookie_hits >= cookie_threshold
    }

    /// Cookie bookkeeping only, with no pacing side effect, used by the
    /// changes-feed reader, which does not participate in pool pacing.
    fn note_cookie(&mut self, cookie: Option<String>) {
        match (&self.last_cookie, &cookie) {
            (Some(prev), Some(new)) if prev == new => self.cookie_hits += 1,
            _ => {
                self.cookie_hits = 0;
                self.last_cookie = cookie;
            }
        }
    }
}

fn set_cookie_of(resp: &reqwest::Response) -> Option<String> {
    resp.headers().get(reqwest::header::SET_COOKIE)?.to_str().ok().map(str::to_string)
}

fn classify_status(status: StatusCode) -> FetchError {
    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Auth(status.as_u16()),
        s if s.as_u16() == 429 || s.is_server_error() => FetchError::TransientStatus(s.as_u16()),
        s => FetchError::Malformed(format!("unexpected upstream status {s}")),
    }
}

/// `GET {host}/api/{version}/{resource}?mode=_all_&limit=L[&offset=...]`
pub async fn fetch_changes_page(
    client: &mut ApiClient,
    base: &str,
    version: &str,
    resource: &str,
    limit: u32,
    offset: Option<&str>,
) -> Result<ChangesPage, FetchError> {
    let mut url = format!("{}/api/{}/{}?mode=_all_&limit={}", base.trim_end_matches('/'), version, resource, limit);
    if let Some(offset) = offset {
        url.push_str(&format!("&offset={offset}"));
    }

    let resp = client.http.get(&url).send().await.map_err(|e| FetchError::Transient(e.to_string()))?;
    let cookie = set_cookie_of(&resp);
    client.note_cookie(cookie);

    if !resp.status().is_success() {
        return Err(classify_status(resp.status()));
    }
    let text = resp.text().await.map_err(|e| FetchError::Transient(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| FetchError::Malformed(e.to_string()))
}

/// `GET {host}/api/{version}/{resource}/{id}`. Returns the document plus the
/// `Set-Cookie` header value observed, for the caller's stickiness tracking.
pub async fn fetch_resource(
    client: &ApiClient,
    base: &str,
    version: &str,
    resource: &str,
    id: &str,
) -> Result<(ResourceDocument, Option<String>), FetchError> {
    let url = format!("{}/api/{}/{}/{}", base.trim_end_matches('/'), version, resource, id);
    let resp = client.http.get(&url).send().await.map_err(|e| FetchError::Transient(e.to_string()))?;
    let status = resp.status();
    let cookie = set_cookie_of(&resp);

    if !status.is_success() {
        return Err(classify_status(status));
    }
    let doc: ResourceDocument = resp.json().await.map_err(|e| FetchError::Malformed(e.to_string()))?;
    Ok((doc, cookie))
}
