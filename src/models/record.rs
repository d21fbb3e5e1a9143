//! Record model: a fully materialized entity with named fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::CollectionType;

/// Shared handle to a materialized record
///
/// Several hits and the caller's working collection may alias the same
/// record; it is dropped with the last handle.
pub type RecordPtr = Arc<Record>;

/// Value kind of a field definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Line,
    Para,
    Number,
    Date,
    Url,
    Table,
}

/// One field definition in a collection schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Internal field name (e.g. "pub_year")
    pub name: String,

    /// Display title
    pub title: String,

    /// Value kind
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn new(name: &str, title: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            kind,
        }
    }
}

/// An ordered schema of typed fields for one collection type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub kind: CollectionType,
    pub fields: Vec<FieldDef>,
}

impl Collection {
    /// Create the default schema for a collection type
    pub fn for_type(kind: CollectionType) -> Self {
        use FieldKind::*;

        let mut fields = vec![FieldDef::new("title", "Title", Line)];
        let extra: &[(&str, &str, FieldKind)] = match kind {
            CollectionType::Book => &[
                ("author", "Author", Line),
                ("publisher", "Publisher", Line),
                ("pub_year", "Publication Year", Number),
                ("isbn", "ISBN#", Line),
                ("lccn", "LCCN#", Line),
                ("pages", "Pages", Number),
                ("plot", "Plot Summary", Para),
            ],
            CollectionType::Bibtex => &[
                ("author", "Author", Line),
                ("journal", "Journal", Line),
                ("year", "Year", Number),
                ("doi", "DOI", Line),
                ("arxiv", "arXiv ID", Line),
                ("pmid", "PubMed ID", Line),
                ("isbn", "ISBN#", Line),
                ("publisher", "Publisher", Line),
                ("url", "URL", Url),
                ("abstract", "Abstract", Para),
            ],
            CollectionType::ComicBook => &[
                ("series", "Series", Line),
                ("issue", "Issue", Number),
                ("writer", "Writer", Line),
                ("publisher", "Publisher", Line),
                ("pub_year", "Publication Year", Number),
                ("isbn", "ISBN#", Line),
            ],
            CollectionType::Video => &[
                ("studio", "Studio", Line),
                ("director", "Director", Line),
                ("year", "Year", Number),
                ("medium", "Medium", Line),
                ("cast", "Cast", Table),
                ("plot", "Plot Summary", Para),
            ],
            CollectionType::Album => &[
                ("artist", "Artist", Line),
                ("label", "Label", Line),
                ("year", "Year", Number),
                ("upc", "UPC/EAN", Line),
                ("track", "Tracks", Table),
            ],
            CollectionType::Game => &[
                ("platform", "Platform", Line),
                ("publisher", "Publisher", Line),
                ("year", "Release Year", Number),
                ("description", "Description", Para),
            ],
            CollectionType::BoardGame => &[
                ("publisher", "Publisher", Line),
                ("designer", "Designer", Line),
                ("year", "Release Year", Number),
                ("num-player", "Number of Players", Line),
            ],
            CollectionType::Wine => &[
                ("producer", "Producer", Line),
                ("appellation", "Appellation", Line),
                ("vintage", "Vintage", Number),
            ],
            CollectionType::Coin => &[
                ("country", "Country", Line),
                ("year", "Year", Number),
                ("denomination", "Denomination", Line),
                ("description", "Description", Para),
            ],
            CollectionType::Stamp => &[
                ("country", "Country", Line),
                ("year", "Year", Number),
                ("denomination", "Denomination", Line),
            ],
            CollectionType::Card => &[
                ("player", "Player", Line),
                ("team", "Team", Line),
                ("brand", "Brand", Line),
                ("year", "Year", Number),
            ],
            CollectionType::File => &[
                ("url", "URL", Url),
                ("mimetype", "Mimetype", Line),
                ("size", "Size", Line),
            ],
            CollectionType::Base => &[],
        };
        fields.extend(extra.iter().map(|(n, t, k)| FieldDef::new(n, t, *k)));

        Self { kind, fields }
    }

    /// Whether the schema defines a field
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Look up a field definition
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A fully materialized entity tied to a collection schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    collection: Arc<Collection>,
    values: BTreeMap<String, String>,
}

impl Record {
    /// Create an empty record for a collection
    pub fn new(collection: Arc<Collection>) -> Self {
        Self {
            collection,
            values: BTreeMap::new(),
        }
    }

    /// Start building a record for a collection type using its default schema
    pub fn builder(kind: CollectionType) -> RecordBuilder {
        RecordBuilder::new(Arc::new(Collection::for_type(kind)))
    }

    /// The collection schema this record belongs to
    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    /// The collection type of this record
    pub fn collection_type(&self) -> CollectionType {
        self.collection.kind
    }

    /// The record title, or an empty string
    pub fn title(&self) -> &str {
        self.field("title")
    }

    /// The formatted value of a field, or an empty string if unset
    pub fn field(&self, name: &str) -> &str {
        self.values.get(name).map(String::as_str).unwrap_or("")
    }

    /// Set a field value; empty values clear the field
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if value.trim().is_empty() {
            self.values.remove(&name);
        } else {
            self.values.insert(name, value);
        }
    }

    /// Iterate over set fields in schema order, then any extra fields
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        let known = self
            .collection
            .fields
            .iter()
            .filter_map(|f| {
                self.values
                    .get_key_value(&f.name)
                    .map(|(k, v)| (k.as_str(), v.as_str()))
            });
        let extra = self
            .values
            .iter()
            .filter(|(k, _)| !self.collection.has_field(k))
            .map(|(k, v)| (k.as_str(), v.as_str()));
        known.chain(extra)
    }

    /// Short human-readable description used in result lists
    pub fn description(&self) -> String {
        let mut desc = String::new();
        let mut append = |field: &str| -> bool {
            let value = self.field(field);
            if value.is_empty() {
                return false;
            }
            if !desc.is_empty() {
                desc.push('/');
            }
            desc.push_str(value);
            true
        };

        match self.collection_type() {
            CollectionType::Book | CollectionType::Bibtex => {
                append("author");
                append("publisher");
                let _ = append("cr_year") || append("pub_year") || append("year");
                append("issue");
            }
            CollectionType::ComicBook => {
                append("series");
                append("issue");
                append("publisher");
                let _ = append("pub_year") || append("year");
            }
            CollectionType::Video => {
                append("studio");
                append("director");
                append("year");
                append("medium");
            }
            CollectionType::Album => {
                append("artist");
                append("label");
                append("year");
            }
            CollectionType::Game => {
                append("platform");
                append("year");
            }
            CollectionType::BoardGame => {
                append("publisher");
                append("designer");
                append("year");
            }
            CollectionType::Wine => {
                append("appellation");
            }
            CollectionType::Coin | CollectionType::Stamp => {
                append("country");
                append("year");
                append("denomination");
            }
            CollectionType::Card => {
                append("player");
                append("team");
                append("year");
            }
            CollectionType::Base | CollectionType::File => {}
        }

        desc
    }
}

/// Builder for creating records
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    pub fn new(collection: Arc<Collection>) -> Self {
        Self {
            record: Record::new(collection),
        }
    }

    pub fn title(self, title: impl Into<String>) -> Self {
        self.field("title", title)
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.record.set_field(name, value);
        self
    }

    pub fn build(self) -> Record {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_description() {
        let record = Record::builder(CollectionType::Book)
            .title("Dune")
            .field("author", "Frank Herbert")
            .field("publisher", "Chilton")
            .field("pub_year", "1965")
            .build();

        assert_eq!(record.title(), "Dune");
        assert_eq!(record.description(), "Frank Herbert/Chilton/1965");
    }

    #[test]
    fn test_video_description_skips_missing() {
        let record = Record::builder(CollectionType::Video)
            .title("Alien")
            .field("director", "Ridley Scott")
            .field("year", "1979")
            .build();

        assert_eq!(record.description(), "Ridley Scott/1979");
    }

    #[test]
    fn test_empty_value_clears_field() {
        let mut record = Record::builder(CollectionType::Book).title("x").build();
        record.set_field("isbn", "123");
        assert_eq!(record.field("isbn"), "123");
        record.set_field("isbn", "  ");
        assert_eq!(record.field("isbn"), "");
    }

    #[test]
    fn test_fields_follow_schema_order() {
        let record = Record::builder(CollectionType::Book)
            .field("isbn", "42")
            .field("zzz_custom", "extra")
            .title("T")
            .field("author", "A")
            .build();

        let names: Vec<&str> = record.fields().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["title", "author", "isbn", "zzz_custom"]);
    }

    #[test]
    fn test_record_equality_is_by_value() {
        let a = Record::builder(CollectionType::Game).title("Doom").build();
        let b = Record::builder(CollectionType::Game).title("Doom").build();
        assert_eq!(a, b);
        assert!(Collection::for_type(CollectionType::Game).has_field("platform"));
    }
}
