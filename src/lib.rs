//! # metafetch
//!
//! Coordinated metadata fetching from many independent data sources.
//!
//! A caller picks a source and a search key, enters a value, and receives a
//! stream of lightweight hits from a background job. Any hit can then be
//! turned into a full record on demand.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`]: Core data structures (Record, SearchHit, FetchRequest, etc.)
//! - [`sources`]: Source plugins with an extensible trait-based architecture
//! - [`manager`]: Process-wide coordinator merging the events of all sources
//! - [`utils`]: HTTP transport, retry, and deduplication
//! - [`config`]: Configuration management

pub mod config;
pub mod manager;
pub mod models;
pub mod sources;
pub mod utils;

// Re-export commonly used types
pub use manager::{Manager, ManagerEvent};
pub use models::{FetchKey, FetchRequest, Record, SearchHit};
pub use sources::{FetchError, Source, SourceEvent, SourceRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
