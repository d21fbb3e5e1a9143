//! Search request models.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of collection a record belongs to
///
/// The integer codes are stable and match the values stored in persisted
/// source settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    Base,
    Book,
    Video,
    Album,
    Bibtex,
    ComicBook,
    Wine,
    Coin,
    Stamp,
    Card,
    Game,
    File,
    BoardGame,
}

impl CollectionType {
    /// All collection types, in code order
    pub const ALL: [CollectionType; 13] = [
        CollectionType::Base,
        CollectionType::Book,
        CollectionType::Video,
        CollectionType::Album,
        CollectionType::Bibtex,
        CollectionType::ComicBook,
        CollectionType::Wine,
        CollectionType::Coin,
        CollectionType::Stamp,
        CollectionType::Card,
        CollectionType::Game,
        CollectionType::File,
        CollectionType::BoardGame,
    ];

    /// Stable integer code
    pub fn code(self) -> i32 {
        self as i32 + 1
    }

    /// Look up a collection type by its integer code
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            CollectionType::Base => "Custom",
            CollectionType::Book => "Book",
            CollectionType::Video => "Video",
            CollectionType::Album => "Music",
            CollectionType::Bibtex => "Bibliography",
            CollectionType::ComicBook => "Comic Book",
            CollectionType::Wine => "Wine",
            CollectionType::Coin => "Coin",
            CollectionType::Stamp => "Stamp",
            CollectionType::Card => "Card",
            CollectionType::Game => "Video Game",
            CollectionType::File => "File",
            CollectionType::BoardGame => "Board Game",
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The field a search value is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchKey {
    Title,
    Person,
    #[serde(rename = "isbn")]
    ISBN,
    #[serde(rename = "upc")]
    UPC,
    Keyword,
    #[serde(rename = "doi")]
    DOI,
    #[serde(rename = "arxiv")]
    ArxivID,
    #[serde(rename = "pubmed")]
    PubmedID,
    #[serde(rename = "lccn")]
    LCCN,
    Raw,
}

impl FetchKey {
    /// All search keys, in display order
    pub const ALL: [FetchKey; 10] = [
        FetchKey::Title,
        FetchKey::Person,
        FetchKey::ISBN,
        FetchKey::UPC,
        FetchKey::Keyword,
        FetchKey::DOI,
        FetchKey::ArxivID,
        FetchKey::PubmedID,
        FetchKey::LCCN,
        FetchKey::Raw,
    ];

    /// Human-readable label
    pub fn label(self) -> &'static str {
        match self {
            FetchKey::Title => "Title",
            FetchKey::Person => "Person",
            FetchKey::ISBN => "ISBN",
            FetchKey::UPC => "UPC/EAN",
            FetchKey::Keyword => "Keyword",
            FetchKey::DOI => "DOI",
            FetchKey::ArxivID => "arXiv ID",
            FetchKey::PubmedID => "PubMed ID",
            FetchKey::LCCN => "LCCN",
            FetchKey::Raw => "Raw Query",
        }
    }

    /// Tag as written in configuration
    pub fn tag(self) -> &'static str {
        match self {
            FetchKey::Title => "title",
            FetchKey::Person => "person",
            FetchKey::ISBN => "isbn",
            FetchKey::UPC => "upc",
            FetchKey::Keyword => "keyword",
            FetchKey::DOI => "doi",
            FetchKey::ArxivID => "arxiv",
            FetchKey::PubmedID => "pubmed",
            FetchKey::LCCN => "lccn",
            FetchKey::Raw => "raw",
        }
    }

    /// The single-bit set for this key
    pub fn flag(self) -> SearchKeys {
        match self {
            FetchKey::Title => SearchKeys::TITLE,
            FetchKey::Person => SearchKeys::PERSON,
            FetchKey::ISBN => SearchKeys::ISBN,
            FetchKey::UPC => SearchKeys::UPC,
            FetchKey::Keyword => SearchKeys::KEYWORD,
            FetchKey::DOI => SearchKeys::DOI,
            FetchKey::ArxivID => SearchKeys::ARXIV_ID,
            FetchKey::PubmedID => SearchKeys::PUBMED_ID,
            FetchKey::LCCN => SearchKeys::LCCN,
            FetchKey::Raw => SearchKeys::RAW,
        }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

bitflags::bitflags! {
    /// Set of search keys a source understands
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SearchKeys: u32 {
        const TITLE = 1 << 0;
        const PERSON = 1 << 1;
        const ISBN = 1 << 2;
        const UPC = 1 << 3;
        const KEYWORD = 1 << 4;
        const DOI = 1 << 5;
        const ARXIV_ID = 1 << 6;
        const PUBMED_ID = 1 << 7;
        const LCCN = 1 << 8;
        const RAW = 1 << 9;
    }
}

impl SearchKeys {
    /// Whether the set contains the given key
    pub fn supports(self, key: FetchKey) -> bool {
        self.contains(key.flag())
    }

    /// The keys in this set, in display order
    pub fn keys(self) -> Vec<FetchKey> {
        FetchKey::ALL
            .iter()
            .copied()
            .filter(|k| self.supports(*k))
            .collect()
    }
}

impl FromIterator<FetchKey> for SearchKeys {
    fn from_iter<I: IntoIterator<Item = FetchKey>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SearchKeys::empty(), |acc, k| acc | k.flag())
    }
}

/// An immutable search request
///
/// An empty request (no value) is the sentinel returned when no usable
/// query can be derived; callers check [`FetchRequest::is_empty`] before
/// dispatching it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Collection type the results should belong to
    pub collection_type: CollectionType,

    /// Which field the value is matched against
    pub key: FetchKey,

    /// Free-form query string
    pub value: String,

    /// Provider-specific opaque data
    pub raw_data: Option<String>,
}

impl FetchRequest {
    /// Create a new request
    pub fn new(collection_type: CollectionType, key: FetchKey, value: impl Into<String>) -> Self {
        Self {
            collection_type,
            key,
            value: value.into(),
            raw_data: None,
        }
    }

    /// The empty sentinel request
    pub fn empty() -> Self {
        Self::new(CollectionType::Base, FetchKey::Title, String::new())
    }

    /// Attach provider-specific data
    pub fn raw_data(mut self, data: impl Into<String>) -> Self {
        self.raw_data = Some(data.into());
        self
    }

    /// Whether the request carries no query value
    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self::empty()
    }
}
