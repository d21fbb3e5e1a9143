//! Process-wide coordinator over the configured sources.
//!
//! The [`Manager`] owns the source directory, dispatches searches and merges
//! every source's events into one stream of [`ManagerEvent`]s. The stream
//! carries exactly one [`ManagerEvent::Done`] per search round, once no
//! dispatched source is outstanding any more, or immediately on `stop()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;

use crate::config::{Config, SourceConfig};
use crate::models::{CollectionType, FetchKey, FetchRequest, RecordPtr, SearchHit};
use crate::sources::{
    EventSink, FetchError, MessageLevel, Source, SourceContext, SourceEvent, SourceLookup,
    SourceRegistry, SourceType,
};
use crate::utils::Transport;

/// Event delivered to the manager's caller
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// A hit from any dispatched source
    HitFound(SearchHit),

    /// A user-facing message, tagged with the name of its source
    Message {
        source: String,
        text: String,
        level: MessageLevel,
    },

    /// The search round is over
    Done,
}

#[derive(Debug)]
struct Registered {
    source: Arc<dyn Source>,
    config: Option<SourceConfig>,
}

/// Ordered list of live sources, shared weakly with aggregators
#[derive(Debug, Default)]
struct SourceDirectory {
    entries: RwLock<Vec<Registered>>,
}

impl SourceDirectory {
    fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|r| Arc::clone(&r.source))
            .collect()
    }

    fn configs(&self) -> Vec<SourceConfig> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(|r| r.config.clone())
            .collect()
    }

    fn replace(&self, entries: Vec<Registered>) {
        *self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = entries;
    }

    fn push(&self, entry: Registered) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
    }
}

impl SourceLookup for SourceDirectory {
    fn source_by_id(&self, id: &str) -> Option<Arc<dyn Source>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|r| r.source.id() == id)
            .map(|r| Arc::clone(&r.source))
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    /// Dispatched invocations that have not reported Done
    outstanding: usize,
    /// Bumped by stop(); relays from older epochs are ignored
    epoch: u64,
    /// Source of the last search, for continue_search
    current: Option<Arc<dyn Source>>,
}

type Dispatch = Arc<Mutex<DispatchState>>;

fn lock(dispatch: &Dispatch) -> std::sync::MutexGuard<'_, DispatchState> {
    dispatch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Coordinates searches across all configured sources
#[derive(Debug)]
pub struct Manager {
    directory: Arc<SourceDirectory>,
    registry: SourceRegistry,
    context: SourceContext,
    events: mpsc::UnboundedSender<ManagerEvent>,
    dispatch: Dispatch,
    /// Instances handed out for updating, so their hits can be resolved
    updaters: Mutex<Vec<Weak<dyn Source>>>,
    next_updater: AtomicU64,
}

impl Manager {
    /// Create a manager and instantiate the configured sources
    ///
    /// Returns the receiving end of the event stream alongside the manager.
    pub fn new(
        registry: SourceRegistry,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let directory = Arc::new(SourceDirectory::default());
        let lookup: Arc<dyn SourceLookup> = directory.clone();
        let context =
            SourceContext::new(transport, Arc::downgrade(&lookup), config.defaults.clone());

        let manager = Self {
            directory,
            registry,
            context,
            events,
            dispatch: Arc::new(Mutex::new(DispatchState::default())),
            updaters: Mutex::new(Vec::new()),
            next_updater: AtomicU64::new(1),
        };
        manager.load_sources(&config.sources);
        (manager, receiver)
    }

    /// Replace all sources with instances built from `configs`
    ///
    /// Entries that fail to build are logged and skipped.
    pub fn load_sources(&self, configs: &[SourceConfig]) {
        self.stop();
        let entries = configs
            .iter()
            .filter_map(|config| match self.registry.create(config, &self.context) {
                Ok(source) => {
                    tracing::debug!("Loaded source {} ({})", source.name(), source.id());
                    Some(Registered {
                        source,
                        config: Some(config.clone()),
                    })
                }
                Err(e) => {
                    tracing::warn!("Skipping source '{}': {}", config.name, e);
                    None
                }
            })
            .collect();
        self.directory.replace(entries);
        lock(&self.dispatch).current = None;
    }

    /// Append an already constructed source
    ///
    /// Such sources have no persisted settings and are not recreated by
    /// [`create_update_sources`](Self::create_update_sources).
    pub fn add_source(&self, source: Arc<dyn Source>) {
        self.directory.push(Registered {
            source,
            config: None,
        });
    }

    /// The registry used to build sources
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// All sources, in configured order
    pub fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.directory.sources()
    }

    /// Sources able to return records of a collection type
    pub fn sources_for(&self, collection: CollectionType) -> Vec<Arc<dyn Source>> {
        self.sources()
            .into_iter()
            .filter(|s| s.can_fetch(collection))
            .collect()
    }

    /// Look up a source by display name
    pub fn source_by_name(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.sources().into_iter().find(|s| s.name() == name)
    }

    /// Look up a source by id
    pub fn source_by_id(&self, id: &str) -> Option<Arc<dyn Source>> {
        self.directory.source_by_id(id)
    }

    /// Search keys of a named source, with their labels
    pub fn key_map(&self, name: &str) -> Vec<(FetchKey, &'static str)> {
        self.source_by_name(name)
            .map(|s| {
                s.search_keys()
                    .keys()
                    .into_iter()
                    .map(|k| (k, k.label()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any source can return records of a collection type
    pub fn can_fetch(&self, collection: CollectionType) -> bool {
        self.sources().iter().any(|s| s.can_fetch(collection))
    }

    /// Whether a search round is in progress
    pub fn is_searching(&self) -> bool {
        lock(&self.dispatch).outstanding > 0
    }

    /// Whether the source of the last search has more results
    pub fn has_more_results(&self) -> bool {
        lock(&self.dispatch)
            .current
            .as_ref()
            .is_some_and(|s| s.has_more_results())
    }

    /// Start a search on the named source
    ///
    /// An empty request, or an unknown source name, ends the round at once.
    pub fn start_search(&self, source_name: &str, request: FetchRequest) {
        if request.is_empty() {
            tracing::debug!("Empty search value, nothing to do");
            self.emit(ManagerEvent::Done);
            return;
        }

        let Some(source) = self.source_by_name(source_name) else {
            tracing::warn!("No source named '{}'", source_name);
            self.emit(ManagerEvent::Done);
            return;
        };

        tracing::debug!(
            "Searching {} for {} = '{}'",
            source.name(),
            request.key,
            request.value
        );
        lock(&self.dispatch).current = Some(Arc::clone(&source));
        self.launch(source, move |source, sink| source.search(request, sink));
    }

    /// Fetch the next page from the source of the last search
    pub fn continue_search(&self) {
        let current = lock(&self.dispatch).current.clone();
        match current {
            Some(source) if source.has_more_results() => {
                self.launch(source, |source, sink| source.continue_search(sink));
            }
            _ => self.emit(ManagerEvent::Done),
        }
    }

    /// Cancel the search round
    ///
    /// Every searching source is stopped and nothing more is relayed from
    /// them. One `Done` is emitted if anything was outstanding.
    pub fn stop(&self) {
        let outstanding = {
            let mut dispatch = lock(&self.dispatch);
            dispatch.epoch += 1;
            std::mem::take(&mut dispatch.outstanding)
        };

        // aggregators first, so a stopped child cannot advance them
        let (aggregators, leaves): (Vec<_>, Vec<_>) = self
            .sources()
            .into_iter()
            .partition(|s| s.source_type() == SourceType::Multiple);
        for source in aggregators.into_iter().chain(leaves) {
            if source.is_searching() {
                tracing::debug!("Stopping {}", source.name());
                source.stop();
            }
        }

        if outstanding > 0 {
            self.emit(ManagerEvent::Done);
        }
    }

    /// Resolve a hit into its full record through the source that issued it
    ///
    /// Hits from instances made by
    /// [`create_update_sources`](Self::create_update_sources) resolve while
    /// those instances are alive.
    pub async fn fetch_entry(&self, hit: &SearchHit) -> Option<RecordPtr> {
        let source = self
            .source_by_id(&hit.source_id)
            .or_else(|| self.updater_by_id(&hit.source_id));
        let Some(source) = source else {
            tracing::warn!("No source with id '{}' for hit {}", hit.source_id, hit.uid);
            return None;
        };
        source.fetch_entry(hit.uid).await
    }

    /// Fresh instances of the sources usable to update records
    ///
    /// Only sources built from settings are recreated. With a key, sources
    /// that cannot search by it are left out.
    pub fn create_update_sources(
        &self,
        collection: CollectionType,
        key: Option<FetchKey>,
    ) -> Vec<Arc<dyn Source>> {
        self.directory
            .configs()
            .iter()
            .filter_map(|config| self.instantiate_updater(config))
            .filter(|s| s.can_fetch(collection) && s.can_update())
            .filter(|s| key.map_or(true, |k| s.can_search(k)))
            .collect()
    }

    /// A fresh instance of the named source, if it can update the collection
    pub fn create_update_source(
        &self,
        collection: CollectionType,
        name: &str,
    ) -> Option<Arc<dyn Source>> {
        self.directory
            .configs()
            .iter()
            .filter(|config| config.name == name)
            .find_map(|config| self.instantiate_updater(config))
            .filter(|s| s.can_fetch(collection) && s.can_update())
    }

    /// Build a fresh instance under its own id and remember it weakly
    fn instantiate_updater(&self, config: &SourceConfig) -> Option<Arc<dyn Source>> {
        let serial = self.next_updater.fetch_add(1, Ordering::Relaxed);
        let config = config.clone().with_id(format!("{}@update-{}", config.id(), serial));
        match self.registry.create(&config, &self.context) {
            Ok(source) => {
                let mut updaters = self
                    .updaters
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                updaters.retain(|s| s.strong_count() > 0);
                updaters.push(Arc::downgrade(&source));
                Some(source)
            }
            Err(e) => {
                tracing::warn!("Could not recreate '{}': {}", config.name, e);
                None
            }
        }
    }

    fn updater_by_id(&self, id: &str) -> Option<Arc<dyn Source>> {
        self.updaters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .find(|s| s.id() == id)
    }

    fn emit(&self, event: ManagerEvent) {
        // a dropped receiver only means nobody is listening
        let _ = self.events.send(event);
    }

    /// Count the invocation as outstanding, start it, and relay its events
    fn launch<F>(&self, source: Arc<dyn Source>, start: F)
    where
        F: FnOnce(&dyn Source, EventSink) -> Result<(), FetchError>,
    {
        let (sink, rx) = mpsc::unbounded_channel();
        let epoch = {
            let mut dispatch = lock(&self.dispatch);
            dispatch.outstanding += 1;
            dispatch.epoch
        };

        if let Err(e) = start(source.as_ref(), sink) {
            tracing::warn!("{}: {}", source.name(), e);
            let mut dispatch = lock(&self.dispatch);
            if dispatch.epoch == epoch {
                let _ = self.events.send(ManagerEvent::Message {
                    source: source.name().to_string(),
                    text: e.to_string(),
                    level: MessageLevel::Warning,
                });
                complete(&mut dispatch, &self.events);
            }
            return;
        }

        tokio::spawn(relay(
            rx,
            epoch,
            source.name().to_string(),
            Arc::clone(&self.dispatch),
            self.events.clone(),
        ));
    }
}

/// Mark one invocation as done, emitting `Done` when none are left
fn complete(dispatch: &mut DispatchState, events: &mpsc::UnboundedSender<ManagerEvent>) {
    if dispatch.outstanding == 0 {
        return;
    }
    dispatch.outstanding -= 1;
    if dispatch.outstanding == 0 {
        let _ = events.send(ManagerEvent::Done);
    }
}

/// Forward one invocation's events until its `Done`
async fn relay(
    mut rx: mpsc::UnboundedReceiver<SourceEvent>,
    epoch: u64,
    source_name: String,
    dispatch: Dispatch,
    events: mpsc::UnboundedSender<ManagerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let mut state = lock(&dispatch);
        if state.epoch != epoch {
            return;
        }
        match event {
            SourceEvent::HitFound(hit) => {
                let _ = events.send(ManagerEvent::HitFound(hit));
            }
            SourceEvent::Message { text, level } => {
                let _ = events.send(ManagerEvent::Message {
                    source: source_name.clone(),
                    text,
                    level,
                });
            }
            SourceEvent::Done { .. } => {
                complete(&mut state, &events);
                return;
            }
        }
    }

    // the source dropped its sink without finishing
    tracing::debug!("{}: event channel closed without Done", source_name);
    let mut state = lock(&dispatch);
    if state.epoch == epoch {
        complete(&mut state, &events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{MockSource, MockTransport};

    fn manager() -> (Manager, mpsc::UnboundedReceiver<ManagerEvent>) {
        Manager::new(
            SourceRegistry::new(),
            Arc::new(MockTransport::new()),
            &Config::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_request_is_immediate_done() {
        let (manager, mut rx) = manager();
        manager.add_source(Arc::new(MockSource::new("m", CollectionType::Book).page(&["A"])));

        manager.start_search("m", FetchRequest::new(CollectionType::Book, FetchKey::Title, "  "));
        assert_eq!(rx.recv().await, Some(ManagerEvent::Done));
        assert!(!manager.is_searching());
    }

    #[tokio::test]
    async fn test_unknown_source_is_immediate_done() {
        let (manager, mut rx) = manager();
        manager.start_search(
            "nowhere",
            FetchRequest::new(CollectionType::Book, FetchKey::Title, "dune"),
        );
        assert_eq!(rx.recv().await, Some(ManagerEvent::Done));
    }

    #[tokio::test]
    async fn test_queries() {
        let (manager, _rx) = manager();
        manager.add_source(Arc::new(
            MockSource::new("books", CollectionType::Book)
                .name("Books")
                .keys(crate::models::SearchKeys::TITLE | crate::models::SearchKeys::ISBN),
        ));
        manager.add_source(Arc::new(
            MockSource::new("films", CollectionType::Video).name("Films"),
        ));

        assert_eq!(manager.sources().len(), 2);
        assert_eq!(manager.sources_for(CollectionType::Book).len(), 1);
        assert!(manager.can_fetch(CollectionType::Video));
        assert!(!manager.can_fetch(CollectionType::Coin));
        assert_eq!(manager.source_by_name("Films").unwrap().id(), "films");
        assert_eq!(
            manager.key_map("Books"),
            vec![(FetchKey::Title, "Title"), (FetchKey::ISBN, "ISBN")]
        );
        assert!(manager.key_map("Nope").is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_idle_emits_nothing() {
        let (manager, mut rx) = manager();
        manager.stop();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unbuildable_sources_are_skipped() {
        let mut config = Config::default();
        config.sources.push(SourceConfig::new(
            crate::sources::SourceType::Other("z3950".into()),
            "Library",
        ));
        let (manager, _rx) = Manager::new(
            SourceRegistry::new(),
            Arc::new(MockTransport::new()),
            &config,
        );
        assert!(manager.sources().is_empty());
    }
}
