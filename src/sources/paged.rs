//! Reusable source for "fetch page, parse, emit hits" providers.
//!
//! A concrete provider implements [`PagedProvider`]; [`PagedSource`] owns
//! the rest of the [`Source`] contract. One `search` or `continue_search`
//! call is exactly one network round trip, the hits parsed from it (at most
//! `limit`), and one `Done`. Further pages are only fetched when the caller
//! asks for them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use super::session::{lock, JobTicket, SearchSession};
use super::{default_update_request, EventSink, FetchError, MessageLevel, Source, SourceType};
use crate::models::{CollectionType, FetchRequest, Record, RecordPtr, SearchHit, SearchKeys, Uid};
use crate::utils::Transport;

/// Pagination position retained between calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// Number of provider results already consumed
    pub offset: usize,
    /// Results requested per page
    pub limit: usize,
    /// 1-based page number
    pub page: usize,
}

impl PageCursor {
    pub fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit,
            page: 1,
        }
    }
}

/// Records parsed out of one response
#[derive(Debug, Clone, Default)]
pub struct ResponsePage {
    /// Matches in provider-response order
    pub records: Vec<Record>,
    /// Total matches reported by the provider, if any
    pub total: Option<usize>,
    /// Provider results the page covered, including ones parsed into nothing
    pub consumed: usize,
}

impl ResponsePage {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            consumed: records.len(),
            records,
            total: None,
        }
    }

    /// Count of provider results behind `records`, when some were skipped
    pub fn consumed(mut self, consumed: usize) -> Self {
        self.consumed = consumed.max(self.records.len());
        self
    }

    pub fn total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }
}

/// Hooks a page-based provider supplies
#[async_trait]
pub trait PagedProvider: Send + Sync + fmt::Debug + 'static {
    /// Registry tag of the provider
    fn source_type(&self) -> SourceType;

    /// Search keys the provider understands
    fn search_keys(&self) -> SearchKeys;

    /// Whether the provider returns records of a collection type
    fn can_fetch(&self, collection: CollectionType) -> bool;

    /// URL for the page at `cursor`, or `None` if the request is unsupported
    fn build_search_url(&self, request: &FetchRequest, cursor: &PageCursor) -> Option<Url>;

    /// Parse one response body
    fn parse_response_page(
        &self,
        body: &[u8],
        request: &FetchRequest,
    ) -> Result<ResponsePage, FetchError>;

    /// Turn the record parsed with a hit into the full record
    ///
    /// Providers whose search responses are incomplete issue further
    /// requests here.
    async fn materialize_hit(
        &self,
        record: &Record,
        _transport: &dyn Transport,
    ) -> Result<Record, FetchError> {
        Ok(record.clone())
    }

    /// Derive the request to re-query this provider for a record
    fn update_request(&self, record: &Record) -> FetchRequest {
        default_update_request(record)
    }
}

/// Per-source paging settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSettings {
    /// Maximum hits emitted per round trip (at least 1)
    pub limit: usize,
    /// Deadline for one round trip
    pub timeout: Duration,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            limit: 25,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PageSettings {
    pub fn limit(mut self, limit: usize) -> Self {
        if limit < 1 {
            tracing::debug!("Limit < 1, changing to 1");
        }
        self.limit = limit.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug)]
enum CachedEntry {
    Pending(Record),
    Ready(RecordPtr),
}

#[derive(Debug)]
struct PageState {
    request: Option<FetchRequest>,
    cursor: PageCursor,
    has_more: bool,
    entries: HashMap<Uid, CachedEntry>,
}

#[derive(Debug)]
struct PagedInner<P: PagedProvider> {
    id: String,
    name: String,
    provider: P,
    transport: Arc<dyn Transport>,
    settings: PageSettings,
    session: SearchSession,
    state: Mutex<PageState>,
}

/// A [`Source`] driven by a [`PagedProvider`]
#[derive(Debug)]
pub struct PagedSource<P: PagedProvider> {
    inner: Arc<PagedInner<P>>,
}

impl<P: PagedProvider> PagedSource<P> {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: P,
        transport: Arc<dyn Transport>,
        settings: PageSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PagedInner {
                id: id.into(),
                name: name.into(),
                provider,
                transport,
                settings,
                session: SearchSession::new(),
                state: Mutex::new(PageState {
                    request: None,
                    cursor: PageCursor::first(settings.limit),
                    has_more: false,
                    entries: HashMap::new(),
                }),
            }),
        }
    }

    /// The wrapped provider
    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    /// Paging settings
    pub fn settings(&self) -> PageSettings {
        self.inner.settings
    }
}

impl<P: PagedProvider> PagedInner<P> {
    fn accepts(&self, request: &FetchRequest) -> bool {
        self.provider.search_keys().supports(request.key)
            && self.provider.can_fetch(request.collection_type)
    }

    /// One round trip: fetch, parse, emit, update the cursor, finish
    async fn run_page(self: Arc<Self>, ticket: JobTicket) {
        if let Err(e) = self.fetch_page(ticket).await {
            tracing::warn!("{}: search failed: {}", self.name, e);
            if self.session.is_current(ticket) {
                lock(&self.state).has_more = false;
            }
            self.session
                .message(ticket, format!("{}: {}", self.name, e), MessageLevel::Warning);
        }
        self.session.finish(ticket, &self.id);
    }

    async fn fetch_page(&self, ticket: JobTicket) -> Result<(), FetchError> {
        let (request, cursor) = {
            let state = lock(&self.state);
            match &state.request {
                Some(request) => (request.clone(), state.cursor),
                None => return Ok(()),
            }
        };

        let Some(url) = self.provider.build_search_url(&request, &cursor) else {
            tracing::debug!("{}: no search url for {:?}", self.name, request.key);
            return Ok(());
        };

        let body = tokio::time::timeout(self.settings.timeout, self.transport.get(&url))
            .await
            .map_err(|_| FetchError::Timeout(self.settings.timeout))??;

        if body.is_empty() {
            tracing::debug!("{}: no data", self.name);
            if self.session.is_current(ticket) {
                lock(&self.state).has_more = false;
            }
            return Ok(());
        }

        let page = self.provider.parse_response_page(&body, &request)?;
        let received = page.records.len();
        let consumed = page.consumed;
        let mut emitted = 0;

        for record in page.records.into_iter().take(self.settings.limit) {
            let hit = SearchHit::from_record(&self.id, &record);
            let uid = hit.uid;
            lock(&self.state)
                .entries
                .insert(uid, CachedEntry::Pending(record));

            if !self.session.hit(ticket, hit) {
                // stopped; nothing after this point may be reported
                lock(&self.state).entries.remove(&uid);
                return Ok(());
            }
            emitted += 1;
        }

        // results cut off by the limit are requested again on the next page
        let advanced = consumed.saturating_sub(received - emitted);
        let fetched = cursor.offset + advanced;
        let has_more = match page.total {
            Some(_) if advanced == 0 => false,
            Some(total) => fetched < total,
            None => received > emitted,
        };

        if !self.session.is_current(ticket) {
            return Ok(());
        }

        let mut state = lock(&self.state);
        state.cursor = PageCursor {
            offset: fetched,
            limit: cursor.limit,
            page: cursor.page + 1,
        };
        state.has_more = has_more;
        tracing::debug!(
            "{}: page {} delivered {} hits of {} results (total {:?}, more: {})",
            self.name,
            cursor.page,
            emitted,
            consumed,
            page.total,
            has_more
        );

        Ok(())
    }
}

#[async_trait]
impl<P: PagedProvider> Source for PagedSource<P> {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn source_type(&self) -> SourceType {
        self.inner.provider.source_type()
    }

    fn search_keys(&self) -> SearchKeys {
        self.inner.provider.search_keys()
    }

    fn can_fetch(&self, collection: CollectionType) -> bool {
        self.inner.provider.can_fetch(collection)
    }

    fn is_searching(&self) -> bool {
        self.inner.session.is_searching()
    }

    fn has_more_results(&self) -> bool {
        lock(&self.inner.state).has_more
    }

    fn search(&self, request: FetchRequest, sink: EventSink) -> Result<(), FetchError> {
        let inner = &self.inner;
        let ticket = inner.session.begin(&inner.id, sink)?;

        {
            let mut state = lock(&inner.state);
            state.request = Some(request.clone());
            state.cursor = PageCursor::first(inner.settings.limit);
            state.has_more = false;
        }

        if !inner.accepts(&request) {
            tracing::debug!(
                "{}: cannot search {:?} for {}",
                inner.name,
                request.key,
                request.collection_type
            );
            inner.session.finish(ticket, &inner.id);
            return Ok(());
        }

        inner
            .session
            .spawn(ticket, Arc::clone(inner).run_page(ticket));
        Ok(())
    }

    fn continue_search(&self, sink: EventSink) -> Result<(), FetchError> {
        let inner = &self.inner;
        let ticket = inner.session.begin(&inner.id, sink)?;

        if !self.has_more_results() {
            inner.session.finish(ticket, &inner.id);
            return Ok(());
        }

        inner
            .session
            .spawn(ticket, Arc::clone(inner).run_page(ticket));
        Ok(())
    }

    fn stop(&self) {
        if self.inner.session.stop(&self.inner.id) {
            tracing::debug!("{}: stopped", self.inner.name);
        }
    }

    async fn fetch_entry(&self, uid: Uid) -> Option<RecordPtr> {
        let pending = {
            let state = lock(&self.inner.state);
            match state.entries.get(&uid) {
                Some(CachedEntry::Ready(record)) => return Some(Arc::clone(record)),
                Some(CachedEntry::Pending(record)) => record.clone(),
                None => {
                    tracing::warn!("{}: no entry for uid {}", self.inner.name, uid);
                    return None;
                }
            }
        };

        let deadline = self.inner.settings.timeout;
        let materialized = tokio::time::timeout(
            deadline,
            self.inner
                .provider
                .materialize_hit(&pending, self.inner.transport.as_ref()),
        )
        .await
        .unwrap_or(Err(FetchError::Timeout(deadline)));

        let record = match materialized {
            Ok(record) => Arc::new(record),
            Err(e) => {
                tracing::warn!("{}: failed to fetch entry {}: {}", self.inner.name, uid, e);
                return None;
            }
        };

        lock(&self.inner.state)
            .entries
            .insert(uid, CachedEntry::Ready(Arc::clone(&record)));
        Some(record)
    }

    fn update_request(&self, record: &Record) -> FetchRequest {
        self.inner.provider.update_request(record)
    }
}
