//! Registry mapping source type tags to factories.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use super::{FetchError, MultiSource, MultiSourceConfig, Source, SourceType};
use crate::config::{Defaults, SourceConfig};
use crate::utils::Transport;

#[cfg(feature = "source-json-api")]
use super::{JsonApiConfig, JsonApiProvider, PagedSource};

/// Resolves source ids to live instances
///
/// Implemented by the manager's source directory; aggregators hold it
/// weakly and resolve their children on every search.
pub trait SourceLookup: Send + Sync {
    fn source_by_id(&self, id: &str) -> Option<Arc<dyn Source>>;
}

/// Everything a factory may need besides the source's own settings
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// Shared network transport
    pub transport: Arc<dyn Transport>,
    /// Directory of configured sources
    pub lookup: Weak<dyn SourceLookup>,
    /// Settings applied unless a source overrides them
    pub defaults: Defaults,
}

impl SourceContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        lookup: Weak<dyn SourceLookup>,
        defaults: Defaults,
    ) -> Self {
        Self {
            transport,
            lookup,
            defaults,
        }
    }
}

/// Builds a source from its persisted entry
pub type SourceFactory =
    Arc<dyn Fn(&SourceConfig, &SourceContext) -> Result<Arc<dyn Source>, FetchError> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    name: String,
    factory: SourceFactory,
}

/// Registry of all instantiable source types
///
/// The SourceRegistry maps a type tag to a display name and a factory, so
/// sources can be recreated from settings.
#[derive(Clone)]
pub struct SourceRegistry {
    types: BTreeMap<SourceType, Registration>,
}

impl SourceRegistry {
    /// Create a registry with the built-in source types
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(
            SourceType::Multiple,
            "Multiple Sources",
            Arc::new(|config: &SourceConfig, context: &SourceContext| {
                let options: MultiSourceConfig = config.options()?;
                let source: Arc<dyn Source> = Arc::new(MultiSource::new(
                    config.id(),
                    config.name.clone(),
                    options,
                    context.lookup.clone(),
                ));
                Ok(source)
            }),
        );

        #[cfg(feature = "source-json-api")]
        registry.register(
            SourceType::JsonApi,
            "JSON API",
            Arc::new(|config: &SourceConfig, context: &SourceContext| {
                let options: JsonApiConfig = config.options()?;
                let provider = JsonApiProvider::new(options)?;
                let source: Arc<dyn Source> = Arc::new(PagedSource::new(
                    config.id(),
                    config.name.clone(),
                    provider,
                    Arc::clone(&context.transport),
                    config.page_settings(&context.defaults),
                ));
                Ok(source)
            }),
        );

        registry
    }

    /// Create a registry without any source types
    pub fn empty() -> Self {
        Self {
            types: BTreeMap::new(),
        }
    }

    /// Register a source type, replacing any previous registration
    pub fn register(&mut self, source_type: SourceType, name: &str, factory: SourceFactory) {
        self.types.insert(
            source_type,
            Registration {
                name: name.to_string(),
                factory,
            },
        );
    }

    /// Instantiate a source from its entry
    pub fn create(
        &self,
        config: &SourceConfig,
        context: &SourceContext,
    ) -> Result<Arc<dyn Source>, FetchError> {
        let registration = self
            .types
            .get(&config.source_type)
            .ok_or_else(|| FetchError::UnknownSource(config.source_type.to_string()))?;
        (registration.factory)(config, context)
    }

    /// Check if a source type is registered
    pub fn has(&self, source_type: &SourceType) -> bool {
        self.types.contains_key(source_type)
    }

    /// Display name of a registered type
    pub fn type_name(&self, source_type: &SourceType) -> Option<&str> {
        self.types.get(source_type).map(|r| r.name.as_str())
    }

    /// Registered types keyed by display name
    pub fn name_type_map(&self) -> BTreeMap<String, SourceType> {
        self.types
            .iter()
            .map(|(tag, r)| (r.name.clone(), tag.clone()))
            .collect()
    }

    /// Get the number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.types.iter().map(|(tag, r)| (tag.tag(), &r.name)))
            .finish()
    }
}
