//! Aggregator source running several configured sources in turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

use super::session::{lock, JobTicket, SearchSession};
use super::{EventSink, FetchError, Source, SourceEvent, SourceLookup, SourceType};
use crate::models::{
    CollectionType, FetchKey, FetchRequest, Record, RecordPtr, SearchHit, SearchKeys, Uid,
};
use crate::utils::find_duplicate;

/// Settings of an aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSourceConfig {
    /// The only collection type this aggregator serves
    pub collection_type: CollectionType,

    /// Child source ids, searched in this order
    #[serde(default)]
    pub sources: Vec<String>,

    /// Fold hits that duplicate one already relayed in the same search into it
    #[serde(default)]
    pub deduplicate: bool,
}

#[derive(Default)]
struct MultiState {
    /// Child currently being driven
    active: Option<Arc<dyn Source>>,
    /// Children taking part in the last search
    searched: Vec<Arc<dyn Source>>,
    /// Outer uid to the children and their own uids; the first one relayed it
    routes: HashMap<Uid, Vec<(Arc<dyn Source>, Uid)>>,
    /// Hits relayed in the current search, for duplicate suppression
    seen: Vec<SearchHit>,
}

struct MultiInner {
    id: String,
    name: String,
    config: MultiSourceConfig,
    lookup: Weak<dyn SourceLookup>,
    session: SearchSession,
    state: Mutex<MultiState>,
}

/// Source that queries its children one after another
///
/// Each child runs to its own `Done` before the next one starts. Hits are
/// relayed with fresh uids owned by the aggregator; `fetch_entry` routes
/// them back to the child that produced them.
pub struct MultiSource {
    inner: Arc<MultiInner>,
}

impl MultiSource {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        config: MultiSourceConfig,
        lookup: Weak<dyn SourceLookup>,
    ) -> Self {
        Self {
            inner: Arc::new(MultiInner {
                id: id.into(),
                name: name.into(),
                config,
                lookup,
                session: SearchSession::new(),
                state: Mutex::new(MultiState::default()),
            }),
        }
    }

    pub fn config(&self) -> &MultiSourceConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for MultiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSource")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl MultiInner {
    /// Resolve the configured children that exist and are not aggregators
    fn children(&self) -> Vec<Arc<dyn Source>> {
        let Some(lookup) = self.lookup.upgrade() else {
            tracing::warn!("{}: source directory is gone", self.name);
            return Vec::new();
        };

        self.config
            .sources
            .iter()
            .filter_map(|id| {
                if *id == self.id {
                    return None;
                }
                match lookup.source_by_id(id) {
                    Some(source) if source.source_type() == SourceType::Multiple => {
                        tracing::warn!("{}: skipping nested aggregator {}", self.name, id);
                        None
                    }
                    Some(source) => Some(source),
                    None => {
                        tracing::warn!("{}: no source with id {}", self.name, id);
                        None
                    }
                }
            })
            .collect()
    }

    /// Run `children` sequentially, relaying their events, then finish
    async fn drive(
        self: Arc<Self>,
        ticket: JobTicket,
        children: Vec<Arc<dyn Source>>,
        request: Option<FetchRequest>,
    ) {
        for child in children {
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                // stop() takes `active` under this lock after leaving the session
                let mut state = lock(&self.state);
                if !self.session.is_current(ticket) {
                    return;
                }
                let started = match &request {
                    Some(request) => child.search(request.clone(), tx),
                    None => child.continue_search(tx),
                };
                if let Err(e) = started {
                    tracing::warn!("{}: could not start {}: {}", self.name, child.name(), e);
                    continue;
                }
                state.active = Some(Arc::clone(&child));
            }
            tracing::debug!("{}: running {}", self.name, child.name());

            while let Some(event) = rx.recv().await {
                match event {
                    SourceEvent::HitFound(hit) => self.relay(ticket, &child, hit),
                    SourceEvent::Message { text, level } => {
                        self.session.message(ticket, text, level);
                    }
                    SourceEvent::Done { .. } => break,
                }
            }

            lock(&self.state).active = None;
            if !self.session.is_current(ticket) {
                tracing::debug!("{}: stopped after {}", self.name, child.name());
                return;
            }
        }

        self.session.finish(ticket, &self.id);
    }

    fn relay(&self, ticket: JobTicket, child: &Arc<dyn Source>, hit: SearchHit) {
        let wrapped = {
            let mut state = lock(&self.state);
            if self.config.deduplicate {
                let original = find_duplicate(&hit, &state.seen).map(|o| (o.uid, o.title.clone()));
                if let Some((outer, title)) = original {
                    tracing::debug!("{}: merging '{}' into '{}'", self.name, hit.title, title);
                    if let Some(route) = state.routes.get_mut(&outer) {
                        route.push((Arc::clone(child), hit.uid));
                    }
                    return;
                }
            }
            let wrapped = hit.rewrap(&self.id);
            state
                .routes
                .insert(wrapped.uid, vec![(Arc::clone(child), hit.uid)]);
            if self.config.deduplicate {
                state.seen.push(wrapped.clone());
            }
            wrapped
        };
        self.session.hit(ticket, wrapped);
    }
}

#[async_trait]
impl Source for MultiSource {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn source_type(&self) -> SourceType {
        SourceType::Multiple
    }

    fn search_keys(&self) -> SearchKeys {
        let collection = self.inner.config.collection_type;
        self.inner
            .children()
            .iter()
            .filter(|child| child.can_fetch(collection))
            .fold(SearchKeys::empty(), |keys, child| keys | child.search_keys())
    }

    fn can_fetch(&self, collection: CollectionType) -> bool {
        collection == self.inner.config.collection_type
    }

    fn is_searching(&self) -> bool {
        self.inner.session.is_searching()
    }

    fn has_more_results(&self) -> bool {
        lock(&self.inner.state)
            .searched
            .iter()
            .any(|child| child.has_more_results())
    }

    fn search(&self, request: FetchRequest, sink: EventSink) -> Result<(), FetchError> {
        let inner = &self.inner;
        let ticket = inner.session.begin(&inner.id, sink)?;

        let children: Vec<_> = if self.can_fetch(request.collection_type) {
            inner
                .children()
                .into_iter()
                .filter(|child| {
                    child.can_fetch(request.collection_type) && child.can_search(request.key)
                })
                .collect()
        } else {
            Vec::new()
        };

        {
            let mut state = lock(&inner.state);
            state.searched = children.clone();
            state.seen.clear();
        }

        if children.is_empty() {
            tracing::debug!("{}: no child can search {:?}", inner.name, request.key);
            inner.session.finish(ticket, &inner.id);
            return Ok(());
        }

        inner.session.spawn(
            ticket,
            Arc::clone(inner).drive(ticket, children, Some(request)),
        );
        Ok(())
    }

    fn continue_search(&self, sink: EventSink) -> Result<(), FetchError> {
        let inner = &self.inner;
        let ticket = inner.session.begin(&inner.id, sink)?;

        let children: Vec<_> = lock(&inner.state)
            .searched
            .iter()
            .filter(|child| child.has_more_results())
            .cloned()
            .collect();

        if children.is_empty() {
            inner.session.finish(ticket, &inner.id);
            return Ok(());
        }

        inner
            .session
            .spawn(ticket, Arc::clone(inner).drive(ticket, children, None));
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.session.stop(&self.inner.id) {
            return;
        }
        let active = lock(&self.inner.state).active.take();
        if let Some(child) = active {
            child.stop();
        }
        tracing::debug!("{}: stopped", self.inner.name);
    }

    async fn fetch_entry(&self, uid: Uid) -> Option<RecordPtr> {
        let routes = lock(&self.inner.state).routes.get(&uid).cloned();
        let routes = match routes {
            Some(routes) => routes,
            None => {
                tracing::warn!("{}: no entry for uid {}", self.inner.name, uid);
                return None;
            }
        };
        if let [(child, child_uid)] = routes.as_slice() {
            return child.fetch_entry(*child_uid).await;
        }

        // duplicates only fill in fields the earlier record lacks
        let mut merged: Option<Record> = None;
        for (child, child_uid) in routes {
            let Some(record) = child.fetch_entry(child_uid).await else {
                continue;
            };
            match merged.as_mut() {
                None => merged = Some(Record::clone(&record)),
                Some(merged) => {
                    for (name, value) in record.fields() {
                        if merged.field(name).is_empty() {
                            merged.set_field(name, value);
                        }
                    }
                }
            }
        }
        merged.map(Arc::new)
    }

    fn update_request(&self, record: &Record) -> FetchRequest {
        let collection = self.inner.config.collection_type;
        let isbn = record.field("isbn");
        if collection == CollectionType::Book && !isbn.is_empty() {
            return FetchRequest::new(collection, FetchKey::ISBN, isbn);
        }
        let title = record.title();
        if !title.is_empty() {
            return FetchRequest::new(collection, FetchKey::Title, title);
        }
        FetchRequest::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MockSource;
    use std::time::Duration;

    #[derive(Default)]
    struct Directory {
        sources: Vec<Arc<dyn Source>>,
    }

    impl SourceLookup for Directory {
        fn source_by_id(&self, id: &str) -> Option<Arc<dyn Source>> {
            self.sources.iter().find(|s| s.id() == id).cloned()
        }
    }

    fn multi(dir: &Arc<Directory>, ids: &[&str], deduplicate: bool) -> MultiSource {
        let lookup: Arc<dyn SourceLookup> = dir.clone();
        MultiSource::new(
            "multi",
            "Multi",
            MultiSourceConfig {
                collection_type: CollectionType::Book,
                sources: ids.iter().map(|s| s.to_string()).collect(),
                deduplicate,
            },
            Arc::downgrade(&lookup),
        )
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<SourceEvent>) -> (Vec<SearchHit>, usize) {
        let mut hits = Vec::new();
        let mut done = 0;
        while let Some(event) = rx.recv().await {
            match event {
                SourceEvent::HitFound(hit) => hits.push(hit),
                SourceEvent::Done { .. } => {
                    done += 1;
                    break;
                }
                SourceEvent::Message { .. } => {}
            }
        }
        (hits, done)
    }

    fn request() -> FetchRequest {
        FetchRequest::new(CollectionType::Book, FetchKey::Title, "x")
    }

    #[tokio::test]
    async fn test_children_run_in_order() {
        let a = Arc::new(MockSource::new("a", CollectionType::Book).page(&["A1", "A2"]));
        let b = Arc::new(MockSource::new("b", CollectionType::Book).page(&["B1"]));
        let dir = Arc::new(Directory {
            sources: vec![a.clone(), b.clone()],
        });
        let source = multi(&dir, &["a", "b"], false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.search(request(), tx).unwrap();
        let (hits, done) = collect(&mut rx).await;

        let titles: Vec<_> = hits.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["A1", "A2", "B1"]);
        assert!(hits.iter().all(|h| h.source_id == "multi"));
        assert_eq!(done, 1);
        assert!(!source.is_searching());
    }

    #[tokio::test]
    async fn test_skips_missing_nested_and_incapable_children() {
        let a = Arc::new(MockSource::new("a", CollectionType::Book).page(&["A1"]));
        let video = Arc::new(MockSource::new("v", CollectionType::Video).page(&["V1"]));
        let dir = Arc::new(Directory {
            sources: vec![a.clone(), video.clone()],
        });
        let source = multi(&dir, &["missing", "multi", "v", "a"], false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.search(request(), tx).unwrap();
        let (hits, _) = collect(&mut rx).await;

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "A1");
        assert_eq!(video.search_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_collection_type_is_immediate_done() {
        let a = Arc::new(MockSource::new("a", CollectionType::Book).page(&["A1"]));
        let dir = Arc::new(Directory { sources: vec![a.clone()] });
        let source = multi(&dir, &["a"], false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = FetchRequest::new(CollectionType::Video, FetchKey::Title, "x");
        source.search(request, tx).unwrap();
        let (hits, done) = collect(&mut rx).await;

        assert!(hits.is_empty());
        assert_eq!(done, 1);
        assert_eq!(a.search_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_entry_routes_to_child() {
        let a = Arc::new(MockSource::new("a", CollectionType::Book).page(&["A1"]));
        let b = Arc::new(MockSource::new("b", CollectionType::Book).page(&["B1"]));
        let dir = Arc::new(Directory {
            sources: vec![a.clone(), b.clone()],
        });
        let source = multi(&dir, &["a", "b"], false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.search(request(), tx).unwrap();
        let (hits, _) = collect(&mut rx).await;

        let record = source.fetch_entry(hits[1].uid).await.unwrap();
        assert_eq!(record.title(), "B1");
        assert_eq!(b.fetch_count(), 1);
        assert_eq!(a.fetch_count(), 0);

        assert!(source.fetch_entry(Uid::next()).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_halts_remaining_children() {
        let a = Arc::new(
            MockSource::new("a", CollectionType::Book)
                .page(&["A1"])
                .delay(Duration::from_millis(100)),
        );
        let b = Arc::new(MockSource::new("b", CollectionType::Book).page(&["B1"]));
        let dir = Arc::new(Directory {
            sources: vec![a.clone(), b.clone()],
        });
        let source = multi(&dir, &["a", "b"], false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.search(request(), tx).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.stop();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SourceEvent::Done { .. }));
        assert!(!a.is_searching());
        assert_eq!(b.search_count(), 0);
    }

    #[tokio::test]
    async fn test_deduplicate_drops_repeats() {
        let a = Arc::new(MockSource::new("a", CollectionType::Book).page(&["Dune", "Emma"]));
        let b = Arc::new(MockSource::new("b", CollectionType::Book).page(&["Dune.", "Solaris"]));
        let dir = Arc::new(Directory {
            sources: vec![a.clone(), b.clone()],
        });
        let source = multi(&dir, &["a", "b"], true);

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.search(request(), tx).unwrap();
        let (hits, _) = collect(&mut rx).await;

        let titles: Vec<_> = hits.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["Dune", "Emma", "Solaris"]);
    }

    #[tokio::test]
    async fn test_duplicate_fills_missing_fields() {
        let a = Arc::new(MockSource::new("a", CollectionType::Book).records(vec![
            Record::builder(CollectionType::Book)
                .title("Dune")
                .field("author", "Frank Herbert")
                .build(),
        ]));
        let b = Arc::new(MockSource::new("b", CollectionType::Book).records(vec![
            Record::builder(CollectionType::Book)
                .title("Dune.")
                .field("author", "F. Herbert")
                .field("publisher", "Chilton Books")
                .build(),
        ]));
        let dir = Arc::new(Directory {
            sources: vec![a.clone(), b.clone()],
        });
        let source = multi(&dir, &["a", "b"], true);

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.search(request(), tx).unwrap();
        let (hits, _) = collect(&mut rx).await;
        assert_eq!(hits.len(), 1);

        let record = source.fetch_entry(hits[0].uid).await.unwrap();
        assert_eq!(record.title(), "Dune");
        assert_eq!(record.field("author"), "Frank Herbert");
        assert_eq!(record.field("publisher"), "Chilton Books");
        assert_eq!(a.fetch_count(), 1);
        assert_eq!(b.fetch_count(), 1);

        let again = source.fetch_entry(hits[0].uid).await.unwrap();
        assert_eq!(record, again);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_never_starts_next_child_on_worker_threads() {
        for _ in 0..20 {
            let a = Arc::new(
                MockSource::new("a", CollectionType::Book)
                    .page(&["A1"])
                    .delay(Duration::from_millis(50)),
            );
            let b = Arc::new(MockSource::new("b", CollectionType::Book).page(&["B1"]));
            let dir = Arc::new(Directory {
                sources: vec![a.clone(), b.clone()],
            });
            let source = multi(&dir, &["a", "b"], false);

            let (tx, mut rx) = mpsc::unbounded_channel();
            source.search(request(), tx).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            source.stop();

            tokio::time::sleep(Duration::from_millis(80)).await;
            let mut done = 0;
            while let Ok(event) = rx.try_recv() {
                assert!(matches!(event, SourceEvent::Done { .. }));
                done += 1;
            }
            assert_eq!(done, 1);
            assert_eq!(b.search_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_continue_runs_children_with_more() {
        let a = Arc::new(
            MockSource::new("a", CollectionType::Book)
                .page(&["A1"])
                .page(&["A2"]),
        );
        let b = Arc::new(MockSource::new("b", CollectionType::Book).page(&["B1"]));
        let dir = Arc::new(Directory {
            sources: vec![a.clone(), b.clone()],
        });
        let source = multi(&dir, &["a", "b"], false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.search(request(), tx).unwrap();
        collect(&mut rx).await;
        assert!(source.has_more_results());

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.continue_search(tx).unwrap();
        let (hits, done) = collect(&mut rx).await;
        assert_eq!(done, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "A2");
        assert!(!source.has_more_results());
        assert_eq!(b.search_count(), 1);
    }

    #[test]
    fn test_search_keys_union_and_update_request() {
        let a = Arc::new(MockSource::new("a", CollectionType::Book).keys(SearchKeys::TITLE));
        let b = Arc::new(MockSource::new("b", CollectionType::Book).keys(SearchKeys::ISBN));
        let v = Arc::new(MockSource::new("v", CollectionType::Video).keys(SearchKeys::UPC));
        let dir = Arc::new(Directory {
            sources: vec![a, b, v],
        });
        let source = multi(&dir, &["a", "b", "v"], false);

        assert_eq!(source.search_keys(), SearchKeys::TITLE | SearchKeys::ISBN);

        let record = Record::builder(CollectionType::Book)
            .title("Dune")
            .field("isbn", "0441013597")
            .build();
        assert_eq!(source.update_request(&record).key, FetchKey::ISBN);
    }
}
