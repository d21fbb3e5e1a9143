//! Core data models for search requests, hits and records.

mod hit;
mod record;
mod request;

pub use hit::{SearchHit, Uid};
pub use record::{Collection, FieldDef, FieldKind, Record, RecordBuilder, RecordPtr};
pub use request::{CollectionType, FetchKey, FetchRequest, SearchKeys};
