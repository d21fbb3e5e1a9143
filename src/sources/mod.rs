//! Metadata sources with an extensible trait-based architecture.
//!
//! This module defines the [`Source`] trait that every data source implements.
//! A source answers capability queries synchronously and runs its searches as
//! asynchronous jobs, reporting through the [`EventSink`] handed to each
//! `search`/`continue_search` call:
//!
//! 1. zero or more [`SourceEvent::HitFound`] in provider-response order
//! 2. optional [`SourceEvent::Message`] events for the user
//! 3. exactly one [`SourceEvent::Done`]
//!
//! Transport and parse failures never escape a source; they become a message
//! plus a zero-hit `Done`. The only error returned from `search` is
//! [`FetchError::AlreadySearching`], and no event is sent in that case.
//!
//! Two reusable implementations cover most providers:
//!
//! - [`PagedSource`]: "fetch page, parse, emit hits" providers; a concrete
//!   provider only supplies the [`PagedProvider`] hooks
//! - [`MultiSource`]: an aggregator running several child sources in turn
//!
//! New source types are made available through the [`SourceRegistry`].

#[cfg(feature = "source-json-api")]
mod json_api;
mod multi;
mod paged;
mod registry;
mod session;

pub mod mock;

#[cfg(feature = "source-json-api")]
pub use json_api::{JsonApiConfig, JsonApiProvider};
pub use mock::{MockSource, MockTransport};
pub use multi::{MultiSource, MultiSourceConfig};
pub use paged::{PageCursor, PageSettings, PagedProvider, PagedSource, ResponsePage};
pub use registry::{SourceContext, SourceFactory, SourceLookup, SourceRegistry};
pub use session::{JobTicket, SearchSession};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::models::{
    CollectionType, FetchKey, FetchRequest, Record, RecordPtr, SearchHit, SearchKeys, Uid,
};

/// Type tag used to instantiate sources from persisted settings
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Aggregator over other configured sources
    Multiple,
    /// Generic configurable JSON API
    JsonApi,
    /// Scripted source used in tests
    Mock,
    #[serde(untagged)]
    Other(String),
}

impl SourceType {
    /// Returns the tag as written in configuration
    pub fn tag(&self) -> &str {
        match self {
            SourceType::Multiple => "multiple",
            SourceType::JsonApi => "json_api",
            SourceType::Mock => "mock",
            SourceType::Other(s) => s,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Severity of a user-facing message routed out of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Status,
    Info,
    Warning,
    Error,
}

/// Event emitted by a running search job
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// One search match, in provider-response order
    HitFound(SearchHit),

    /// Human-readable message for the side channel
    Message { text: String, level: MessageLevel },

    /// Terminal event; sent exactly once per accepted invocation
    Done { source_id: String },
}

/// Channel receiving the events of one search invocation
pub type EventSink = mpsc::UnboundedSender<SourceEvent>;

/// The Source trait defines the interface for all metadata sources.
///
/// # Implementing a New Source
///
/// Most providers should implement [`PagedProvider`] and be wrapped in a
/// [`PagedSource`], which owns the job lifecycle. Implement `Source`
/// directly only for sources with a different shape, and keep the
/// protocol: one `Done` per accepted invocation, even on failure or
/// capability mismatch.
#[async_trait]
pub trait Source: Send + Sync + fmt::Debug {
    /// Stable unique identifier of this instance
    fn id(&self) -> &str;

    /// Display name, as chosen by the user
    fn name(&self) -> &str;

    /// Registry tag of this source
    fn source_type(&self) -> SourceType;

    /// Search keys this source understands
    fn search_keys(&self) -> SearchKeys;

    /// Whether this source can search using a key
    fn can_search(&self, key: FetchKey) -> bool {
        self.search_keys().supports(key)
    }

    /// Whether this source may return records of a collection type
    fn can_fetch(&self, collection: CollectionType) -> bool;

    /// Whether this source can be used to update existing records
    fn can_update(&self) -> bool {
        true
    }

    /// Whether a search job is currently in flight
    fn is_searching(&self) -> bool;

    /// Whether the last response indicated further pages
    fn has_more_results(&self) -> bool;

    /// Start a search job
    fn search(&self, request: FetchRequest, sink: EventSink) -> Result<(), FetchError>;

    /// Fetch the next page of the previous search
    ///
    /// Emits `Done` immediately when there are no more results.
    fn continue_search(&self, sink: EventSink) -> Result<(), FetchError>;

    /// Cancel the running job, if any
    ///
    /// The job's sink receives exactly one `Done`; hits not yet delivered
    /// are discarded. Stopping an idle source does nothing.
    fn stop(&self);

    /// Resolve a hit issued by this source into a full record
    ///
    /// Returns `None` for a uid this instance never issued, or when
    /// materializing fails.
    async fn fetch_entry(&self, uid: Uid) -> Option<RecordPtr>;

    /// Derive the request to re-query this source for a record
    fn update_request(&self, record: &Record) -> FetchRequest {
        default_update_request(record)
    }
}

/// Prefer an ISBN, then the title; empty if neither is set
pub fn default_update_request(record: &Record) -> FetchRequest {
    let collection = record.collection_type();
    let isbn = record.field("isbn");
    if !isbn.is_empty() {
        return FetchRequest::new(collection, FetchKey::ISBN, isbn);
    }
    let title = record.title();
    if !title.is_empty() {
        return FetchRequest::new(collection, FetchKey::Title, title);
    }
    FetchRequest::empty()
}

/// Errors that can occur when interacting with a source
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network or HTTP error
    #[error("Network error: {0}")]
    Network(String),

    /// Parsing error (JSON, XML, etc.)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The job exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// No registered factory for a source type
    #[error("Unknown source type: {0}")]
    UnknownSource(String),

    /// A uid this source never issued
    #[error("Unknown hit: {0}")]
    UnknownHit(Uid),

    /// A search was started while another is in flight
    #[error("Source '{0}' is already searching")]
    AlreadySearching(String),

    /// Invalid source settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (file system)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Parse(format!("JSON: {}", err))
    }
}
