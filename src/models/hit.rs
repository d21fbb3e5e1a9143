//! Search hit model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Record;

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a search hit
///
/// A uid only has meaning together with the source that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(u64);

impl Uid {
    /// Allocate a fresh uid
    pub fn next() -> Self {
        Uid(NEXT_UID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row in a result list, before the full record is fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Unique within the issuing source
    pub uid: Uid,

    /// Id of the source that issued this hit; used to route `fetch_entry`
    pub source_id: String,

    /// Display title
    pub title: String,

    /// Short human-readable description
    pub description: String,

    /// ISBN, if known
    pub isbn: Option<String>,
}

impl SearchHit {
    /// Create a hit with a fresh uid
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            uid: Uid::next(),
            source_id: source_id.into(),
            title: title.into(),
            description: description.into(),
            isbn: None,
        }
    }

    /// Create a hit summarizing a record
    pub fn from_record(source_id: impl Into<String>, record: &Record) -> Self {
        let isbn = record.field("isbn");
        Self::new(source_id, record.title(), record.description())
            .isbn(Some(isbn).filter(|s| !s.is_empty()).map(str::to_string))
    }

    /// Set the ISBN
    pub fn isbn(mut self, isbn: Option<String>) -> Self {
        self.isbn = isbn;
        self
    }

    /// Copy this hit under a new owner with a fresh uid
    pub fn rewrap(&self, source_id: impl Into<String>) -> Self {
        Self {
            uid: Uid::next(),
            source_id: source_id.into(),
            title: self.title.clone(),
            description: self.description.clone(),
            isbn: self.isbn.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CollectionType;

    #[test]
    fn test_uids_are_unique() {
        let a = SearchHit::new("src", "A", "");
        let b = SearchHit::new("src", "A", "");
        assert_ne!(a.uid, b.uid);
    }

    #[test]
    fn test_from_record() {
        let record = Record::builder(CollectionType::Book)
            .title("Emma")
            .field("author", "Jane Austen")
            .field("isbn", "9780141439587")
            .build();

        let hit = SearchHit::from_record("books", &record);
        assert_eq!(hit.title, "Emma");
        assert_eq!(hit.description, "Jane Austen");
        assert_eq!(hit.isbn.as_deref(), Some("9780141439587"));
        assert_eq!(hit.source_id, "books");
    }

    #[test]
    fn test_rewrap_changes_owner_and_uid() {
        let hit = SearchHit::new("child", "T", "D");
        let wrapped = hit.rewrap("multi");
        assert_eq!(wrapped.source_id, "multi");
        assert_eq!(wrapped.title, hit.title);
        assert_ne!(wrapped.uid, hit.uid);
    }
}
