//! HTTP bindings for the two external systems the bridge talks to: the
//! upstream procurement API and the local CouchDB-style document store.

pub mod store;
pub mod upstream;

pub use store::StoreClient;
pub use upstream::ApiClient;
