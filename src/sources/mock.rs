//! Mock source and transport for testing purposes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use super::session::{lock, JobTicket, SearchSession};
use super::{EventSink, FetchError, MessageLevel, Source, SourceType};
use crate::models::{
    CollectionType, FetchRequest, Record, RecordPtr, SearchHit, SearchKeys, Uid,
};
use crate::utils::Transport;

/// What a mock source answers with
#[derive(Debug, Clone, Default)]
struct MockScript {
    pages: Vec<Vec<Record>>,
    delay: Option<Duration>,
    failure: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    started: bool,
    next_page: usize,
    records: HashMap<Uid, RecordPtr>,
}

#[derive(Debug, Default)]
struct MockShared {
    session: SearchSession,
    state: Mutex<MockState>,
    search_count: AtomicUsize,
    fetch_count: AtomicUsize,
}

/// A source that serves scripted pages of records
///
/// Each `search` serves the first page, each `continue_search` the next
/// one. An optional delay precedes every page, and a scripted failure turns
/// every round trip into a warning plus an empty `Done`.
#[derive(Debug)]
pub struct MockSource {
    id: String,
    name: String,
    collection: CollectionType,
    keys: SearchKeys,
    script: MockScript,
    shared: Arc<MockShared>,
}

impl MockSource {
    /// Create a mock source serving one collection type, accepting all keys
    pub fn new(id: impl Into<String>, collection: CollectionType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            collection,
            keys: SearchKeys::all(),
            script: MockScript::default(),
            shared: Arc::new(MockShared::default()),
        }
    }

    /// Set the display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Restrict the accepted search keys
    pub fn keys(mut self, keys: SearchKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Append a page of records with the given titles
    pub fn page(mut self, titles: &[&str]) -> Self {
        let collection = self.collection;
        self.script.pages.push(
            titles
                .iter()
                .map(|t| Record::builder(collection).title(*t).build())
                .collect(),
        );
        self
    }

    /// Append a page of prepared records
    pub fn records(mut self, records: Vec<Record>) -> Self {
        self.script.pages.push(records);
        self
    }

    /// Wait before serving each page
    pub fn delay(mut self, delay: Duration) -> Self {
        self.script.delay = Some(delay);
        self
    }

    /// Fail every round trip with this message
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.script.failure = Some(message.into());
        self
    }

    /// Number of `search` calls accepted or rejected so far
    pub fn search_count(&self) -> usize {
        self.shared.search_count.load(Ordering::SeqCst)
    }

    /// Number of `fetch_entry` calls so far
    pub fn fetch_count(&self) -> usize {
        self.shared.fetch_count.load(Ordering::SeqCst)
    }

    fn start_page(&self, ticket: JobTicket) {
        let page = {
            let state = lock(&self.shared.state);
            self.script.pages.get(state.next_page).cloned().unwrap_or_default()
        };
        let shared = Arc::clone(&self.shared);
        let id = self.id.clone();
        let script = self.script.clone();

        self.shared.session.spawn(ticket, async move {
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(failure) = script.failure {
                tracing::warn!("{}: {}", id, failure);
                shared.session.message(ticket, failure, MessageLevel::Warning);
                shared.session.finish(ticket, &id);
                return;
            }

            for record in page {
                let hit = SearchHit::from_record(&id, &record);
                lock(&shared.state)
                    .records
                    .insert(hit.uid, Arc::new(record));
                if !shared.session.hit(ticket, hit) {
                    return;
                }
            }

            if shared.session.is_current(ticket) {
                lock(&shared.state).next_page += 1;
            }
            shared.session.finish(ticket, &id);
        });
    }
}

#[async_trait]
impl Source for MockSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> SourceType {
        SourceType::Mock
    }

    fn search_keys(&self) -> SearchKeys {
        self.keys
    }

    fn can_fetch(&self, collection: CollectionType) -> bool {
        collection == self.collection
    }

    fn is_searching(&self) -> bool {
        self.shared.session.is_searching()
    }

    fn has_more_results(&self) -> bool {
        let state = lock(&self.shared.state);
        state.started && state.next_page < self.script.pages.len()
    }

    fn search(&self, request: FetchRequest, sink: EventSink) -> Result<(), FetchError> {
        self.shared.search_count.fetch_add(1, Ordering::SeqCst);
        let ticket = self.shared.session.begin(&self.id, sink)?;
        {
            let mut state = lock(&self.shared.state);
            state.started = true;
            state.next_page = 0;
        }

        if !self.can_search(request.key) || !self.can_fetch(request.collection_type) {
            self.shared.session.finish(ticket, &self.id);
            return Ok(());
        }

        self.start_page(ticket);
        Ok(())
    }

    fn continue_search(&self, sink: EventSink) -> Result<(), FetchError> {
        let ticket = self.shared.session.begin(&self.id, sink)?;
        if !self.has_more_results() {
            self.shared.session.finish(ticket, &self.id);
            return Ok(());
        }
        self.start_page(ticket);
        Ok(())
    }

    fn stop(&self) {
        self.shared.session.stop(&self.id);
    }

    async fn fetch_entry(&self, uid: Uid) -> Option<RecordPtr> {
        self.shared.fetch_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.state).records.get(&uid).cloned()
    }
}

/// A transport answering from a table of canned responses
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: HashMap<String, Result<Vec<u8>, String>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with `body`
    pub fn respond(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(url.to_string(), Ok(body.into()));
        self
    }

    /// Fail requests for `url`
    pub fn fail(mut self, url: &str, message: impl Into<String>) -> Self {
        self.responses.insert(url.to_string(), Err(message.into()));
        self
    }

    /// Wait before answering any request
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of requests issued so far
    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// URLs requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        lock(&self.requests).push(url.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.responses.get(url.as_str()) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(message)) => Err(FetchError::Network(message.clone())),
            None => Err(FetchError::Network(format!("no response for {}", url))),
        }
    }
}

/// Helper function to create a book record for testing.
pub fn make_record(title: &str) -> Record {
    Record::builder(CollectionType::Book).title(title).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchKey;
    use crate::sources::SourceEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_mock_source_serves_pages() {
        let source = MockSource::new("m", CollectionType::Book)
            .page(&["One", "Two"])
            .page(&["Three"]);
        assert!(!source.has_more_results());

        let (tx, mut rx) = mpsc::unbounded_channel();
        source
            .search(FetchRequest::new(CollectionType::Book, FetchKey::Title, "q"), tx)
            .unwrap();

        let mut titles = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SourceEvent::HitFound(hit) => titles.push(hit.title),
                SourceEvent::Done { source_id } => {
                    assert_eq!(source_id, "m");
                    break;
                }
                SourceEvent::Message { .. } => {}
            }
        }
        assert_eq!(titles, vec!["One", "Two"]);
        assert!(source.has_more_results());
        assert_eq!(source.search_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport() {
        let transport = MockTransport::new()
            .respond("http://a.test/ok", "body")
            .fail("http://a.test/bad", "boom");

        let ok = transport.get(&Url::parse("http://a.test/ok").unwrap()).await;
        assert_eq!(ok.unwrap(), b"body".to_vec());

        let bad = transport.get(&Url::parse("http://a.test/bad").unwrap()).await;
        assert!(matches!(bad, Err(FetchError::Network(m)) if m == "boom"));

        assert!(transport
            .get(&Url::parse("http://a.test/missing").unwrap())
            .await
            .is_err());
        assert_eq!(transport.request_count(), 3);
    }

    #[test]
    fn test_make_record() {
        let record = make_record("Dune");
        assert_eq!(record.title(), "Dune");
        assert_eq!(record.collection_type(), CollectionType::Book);
    }
}
