//! Generic configurable JSON API provider.
//!
//! Describes a search endpoint entirely in settings: a URL template, JSON
//! pointers locating the result array and the total count, and a map from
//! record field to JSON pointer inside each result item.
//!
//! Template placeholders: `{value}` (URL-encoded search value), `{key}`,
//! `{offset}`, `{limit}` and `{page}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

use super::{FetchError, PageCursor, PagedProvider, ResponsePage, SourceType};
use crate::models::{CollectionType, FetchKey, FetchRequest, Record, SearchKeys};
use crate::utils::Transport;

/// Settings of a JSON API source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonApiConfig {
    /// Search URL template
    pub url: String,

    /// The collection type returned by the endpoint
    pub collection_type: CollectionType,

    /// Accepted search keys
    #[serde(default = "default_keys")]
    pub keys: Vec<FetchKey>,

    /// Value substituted for `{key}`, by key tag; defaults to the tag itself
    #[serde(default)]
    pub key_names: BTreeMap<String, String>,

    /// Pointer to the array of results; empty means the document root
    #[serde(default)]
    pub results: String,

    /// Pointer to the total number of matches
    #[serde(default)]
    pub total: Option<String>,

    /// Record field name to pointer within a result item
    #[serde(default = "default_fields")]
    pub fields: BTreeMap<String, String>,

    /// Template of a per-entry URL, with `{id}` taken from the `id` field
    #[serde(default)]
    pub entry_url: Option<String>,

    /// Pointers used on the per-entry document; defaults to `fields`
    #[serde(default)]
    pub entry_fields: BTreeMap<String, String>,
}

fn default_keys() -> Vec<FetchKey> {
    vec![FetchKey::Title]
}

fn default_fields() -> BTreeMap<String, String> {
    BTreeMap::from([("title".to_string(), "/title".to_string())])
}

/// Paged provider driven by a [`JsonApiConfig`]
#[derive(Debug, Clone)]
pub struct JsonApiProvider {
    config: JsonApiConfig,
    keys: SearchKeys,
}

impl JsonApiProvider {
    /// Validate the settings and build the provider
    pub fn new(config: JsonApiConfig) -> Result<Self, FetchError> {
        if !config.url.contains("{value}") {
            return Err(FetchError::Config(format!(
                "url template '{}' has no {{value}} placeholder",
                config.url
            )));
        }
        if !config.fields.contains_key("title") {
            return Err(FetchError::Config("no pointer for the title field".to_string()));
        }
        let keys = config.keys.iter().copied().collect();
        Ok(Self { config, keys })
    }

    pub fn config(&self) -> &JsonApiConfig {
        &self.config
    }

    fn key_name(&self, key: FetchKey) -> &str {
        self.config
            .key_names
            .get(key.tag())
            .map(String::as_str)
            .unwrap_or(key.tag())
    }

    /// Build a record from one result item using a field map
    fn parse_item(&self, item: &Value, fields: &BTreeMap<String, String>) -> Record {
        let mut record = Record::builder(self.config.collection_type).build();
        for (name, pointer) in fields {
            if let Some(value) = item.pointer(pointer).and_then(value_text) {
                record.set_field(name.as_str(), value);
            }
        }
        record
    }
}

/// Render a JSON value as field text; arrays are joined with "; "
fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(_) => return None,
    };
    Some(text).filter(|t| !t.is_empty())
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|e| FetchError::InvalidRequest(format!("bad url '{}': {}", url, e)))
}

#[async_trait]
impl PagedProvider for JsonApiProvider {
    fn source_type(&self) -> SourceType {
        SourceType::JsonApi
    }

    fn search_keys(&self) -> SearchKeys {
        self.keys
    }

    fn can_fetch(&self, collection: CollectionType) -> bool {
        collection == self.config.collection_type
    }

    fn build_search_url(&self, request: &FetchRequest, cursor: &PageCursor) -> Option<Url> {
        let value = match request.key {
            FetchKey::Raw => request.value.clone(),
            _ => urlencoding::encode(request.value.trim()).into_owned(),
        };

        let url = self
            .config
            .url
            .replace("{value}", &value)
            .replace("{key}", self.key_name(request.key))
            .replace("{offset}", &cursor.offset.to_string())
            .replace("{limit}", &cursor.limit.to_string())
            .replace("{page}", &cursor.page.to_string());

        match parse_url(&url) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        }
    }

    fn parse_response_page(
        &self,
        body: &[u8],
        _request: &FetchRequest,
    ) -> Result<ResponsePage, FetchError> {
        let doc: Value = serde_json::from_slice(body)?;

        let items: &[Value] = match doc.pointer(&self.config.results) {
            Some(Value::Array(items)) => items.as_slice(),
            Some(_) => {
                return Err(FetchError::Parse(format!(
                    "'{}' is not an array",
                    self.config.results
                )))
            }
            None => &[],
        };

        let records = items
            .iter()
            .map(|item| self.parse_item(item, &self.config.fields))
            .filter(|record| {
                if record.title().is_empty() {
                    tracing::debug!("skipping result without a title");
                    return false;
                }
                true
            })
            .collect();

        let total = self
            .config
            .total
            .as_deref()
            .and_then(|pointer| doc.pointer(pointer))
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .and_then(|n| usize::try_from(n).ok());

        Ok(ResponsePage {
            records,
            total,
            consumed: items.len(),
        })
    }

    async fn materialize_hit(
        &self,
        record: &Record,
        transport: &dyn Transport,
    ) -> Result<Record, FetchError> {
        let Some(template) = &self.config.entry_url else {
            return Ok(record.clone());
        };
        let id = record.field("id");
        if id.is_empty() {
            return Ok(record.clone());
        }

        let url = parse_url(&template.replace("{id}", &urlencoding::encode(id)))?;
        let body = transport.get(&url).await?;
        let doc: Value = serde_json::from_slice(&body)?;

        let fields = if self.config.entry_fields.is_empty() {
            &self.config.fields
        } else {
            &self.config.entry_fields
        };

        let mut full = record.clone();
        for (name, value) in self.parse_item(&doc, fields).fields() {
            full.set_field(name, value);
        }
        Ok(full)
    }
}
