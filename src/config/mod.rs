//! Configuration management.
//!
//! Settings come from a TOML file, optionally overridden by environment
//! variables prefixed with `METAFETCH` (e.g. `METAFETCH_DEFAULTS__LIMIT=10`).
//!
//! ```toml
//! [defaults]
//! timeout_secs = 30
//! limit = 25
//!
//! [[sources]]
//! type = "json_api"
//! name = "Open Library"
//! id = "openlibrary"
//! url = "https://openlibrary.org/search.json?q={value}&offset={offset}&limit={limit}"
//! collection_type = "book"
//! keys = ["title", "person", "isbn"]
//! results = "/docs"
//! total = "/numFound"
//!
//! [sources.fields]
//! title = "/title"
//! author = "/author_name/0"
//! year = "/first_publish_year"
//!
//! [[sources]]
//! type = "multiple"
//! name = "All Books"
//! collection_type = "book"
//! sources = ["openlibrary"]
//! ```

mod file_config;

pub use file_config::ConfigFileError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sources::{FetchError, PageSettings, SourceType};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Settings applied to every source unless overridden
    #[serde(default)]
    pub defaults: Defaults,

    /// Configured sources, in display order
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Settings shared by all sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    /// Deadline for one network round trip, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum hits per round trip
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// User agent sent with HTTP requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            limit: default_limit(),
            user_agent: default_user_agent(),
        }
    }
}

impl Defaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn page_settings(&self) -> PageSettings {
        PageSettings::default()
            .limit(self.limit)
            .timeout(self.timeout())
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_limit() -> usize {
    25
}

fn default_user_agent() -> String {
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string()
}

/// One persisted source entry
///
/// Provider-specific options sit next to the common keys and are
/// deserialized by the factory of the source type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Registry tag
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// Display name
    pub name: String,

    /// Stable identifier; derived from the type and name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Provider options
    #[serde(flatten)]
    pub options: toml::Table,
}

impl SourceConfig {
    pub fn new(source_type: SourceType, name: impl Into<String>) -> Self {
        Self {
            source_type,
            name: name.into(),
            id: None,
            options: toml::Table::new(),
        }
    }

    /// Set the identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set one provider option
    pub fn with_option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// The identifier of the source built from this entry
    pub fn id(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}-{}", self.source_type.tag(), slug(&self.name)),
        }
    }

    /// Deserialize the provider options
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|e: toml::de::Error| {
                FetchError::Config(format!("source '{}': {}", self.name, e.message()))
            })
    }

    /// Paging settings, with `limit` and `timeout_secs` overridable per source
    pub fn page_settings(&self, defaults: &Defaults) -> PageSettings {
        let mut settings = defaults.page_settings();
        if let Some(limit) = self.options.get("limit").and_then(toml::Value::as_integer) {
            settings = settings.limit(usize::try_from(limit).unwrap_or(0));
        }
        if let Some(secs) = self
            .options
            .get("timeout_secs")
            .and_then(toml::Value::as_integer)
        {
            settings = settings.timeout(Duration::from_secs(u64::try_from(secs).unwrap_or(0)));
        }
        settings
    }
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Load configuration from a file, with environment overrides
pub fn load_config(path: &Path) -> Result<Config, config::ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(
            config::Environment::with_prefix("METAFETCH")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize()
}

/// Default location of the configuration file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("metafetch").join("config.toml"))
}

/// Find the configuration file to use
///
/// An explicit path wins; otherwise `./metafetch.toml`, then the default
/// location, whichever exists first.
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("metafetch.toml");
    if local.exists() {
        return Some(local);
    }
    default_config_path().filter(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[defaults]
timeout_secs = 5
limit = 10

[[sources]]
type = "json_api"
name = "Open Library"
id = "openlibrary"
url = "https://openlibrary.org/search.json?q={value}"
collection_type = "book"
keys = ["title", "isbn"]
limit = 3

[[sources]]
type = "multiple"
name = "All Books"
collection_type = "book"
sources = ["openlibrary"]
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.defaults.timeout_secs, 30);
        assert_eq!(config.defaults.limit, 25);
        assert!(config.defaults.user_agent.starts_with("metafetch/"));
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_load_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.defaults.timeout_secs, 5);
        assert_eq!(config.sources.len(), 2);

        let json = &config.sources[0];
        assert_eq!(json.source_type, SourceType::JsonApi);
        assert_eq!(json.id(), "openlibrary");
        assert!(json.options.contains_key("url"));

        let settings = json.page_settings(&config.defaults);
        assert_eq!(settings.limit, 3);
        assert_eq!(settings.timeout, Duration::from_secs(5));

        let multi = &config.sources[1];
        assert_eq!(multi.source_type, SourceType::Multiple);
        assert_eq!(multi.id(), "multiple-all-books");
    }

    #[test]
    fn test_options_deserialize() {
        #[derive(Debug, Deserialize)]
        struct Opts {
            url: String,
            #[serde(default)]
            limit: usize,
        }

        let config: Config = toml::from_str(SAMPLE).unwrap();
        let opts: Opts = config.sources[0].options().unwrap();
        assert!(opts.url.contains("{value}"));
        assert_eq!(opts.limit, 3);

        let err = config.sources[1].options::<Opts>().unwrap_err();
        assert!(matches!(err, FetchError::Config(_)));
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        let entry = SourceConfig::new(SourceType::JsonApi, "x").with_option("limit", 0i64);
        assert_eq!(entry.page_settings(&Defaults::default()).limit, 1);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_config(Path::new("/nonexistent/metafetch.toml")).is_err());
    }

    #[test]
    fn test_find_config_file_prefers_explicit() {
        let path = PathBuf::from("/tmp/custom.toml");
        assert_eq!(find_config_file(Some(&path)), Some(path));
    }
}
