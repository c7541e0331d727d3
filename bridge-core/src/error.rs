use thiserror::Error;

/// Fatal at startup: reported on stderr and the process exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration is missing the `main` section")]
    MissingMainSection,
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid resources_api_server: {0:?}")]
    InvalidApiServer(String),
}

/// Errors from a single upstream HTTP call (changes feed page or resource fetch).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
    #[error("upstream request failed: {0}")]
    Transient(String),
    #[error("upstream returned a transient status: {0}")]
    TransientStatus(u16),
    #[error("resource not found upstream")]
    NotFound,
    #[error("upstream rejected the request: status {0}")]
    Auth(u16),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// Split from `FetchError` because the changes-feed reader's recovery policy
/// (internal retry vs. restart-next-watch-interval) differs from a worker's.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transient feed error: {0}")]
    Transient(String),
    #[error("fatal feed error: {0}")]
    Fatal(String),
}

/// Errors from the local document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(String),
    #[error("store revision conflict")]
    Conflict,
    #[error("store unavailable: status {0}")]
    Unavailable(u16),
    #[error("malformed store response: {0}")]
    Malformed(String),
}
