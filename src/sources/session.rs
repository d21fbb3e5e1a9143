//! Job bookkeeping shared by source implementations.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use super::{EventSink, FetchError, MessageLevel, SourceEvent};
use crate::models::SearchHit;

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle identifying one accepted search invocation
///
/// Events sent with a ticket from a stopped or finished job are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTicket {
    generation: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    generation: u64,
    sink: Option<EventSink>,
    task: Option<JoinHandle<()>>,
}

/// Tracks the single in-flight job of a source
///
/// The session is "searching" while it holds the sink of an accepted
/// invocation. It hands that sink exactly one `Done`, either from
/// [`finish`](Self::finish) or from [`stop`](Self::stop), whichever comes
/// first.
#[derive(Debug, Default)]
pub struct SearchSession {
    state: Mutex<SessionState>,
}

impl SearchSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a job is in flight
    pub fn is_searching(&self) -> bool {
        lock(&self.state).sink.is_some()
    }

    /// Accept a new invocation, failing fast if one is already running
    pub fn begin(&self, source_id: &str, sink: EventSink) -> Result<JobTicket, FetchError> {
        let mut state = lock(&self.state);
        if state.sink.is_some() {
            return Err(FetchError::AlreadySearching(source_id.to_string()));
        }
        state.generation += 1;
        state.sink = Some(sink);
        state.task = None;
        Ok(JobTicket {
            generation: state.generation,
        })
    }

    /// Whether the ticket still belongs to the running job
    pub fn is_current(&self, ticket: JobTicket) -> bool {
        let state = lock(&self.state);
        state.generation == ticket.generation && state.sink.is_some()
    }

    /// Run the job body on the runtime and remember its handle for `stop`
    pub fn spawn<F>(&self, ticket: JobTicket, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(job);
        let mut state = lock(&self.state);
        if state.generation != ticket.generation {
            // stopped before the handle could be recorded
            handle.abort();
        } else if state.sink.is_some() {
            state.task = Some(handle);
        }
    }

    /// Deliver a hit; returns false if the job was stopped
    pub fn hit(&self, ticket: JobTicket, hit: SearchHit) -> bool {
        self.send(ticket, SourceEvent::HitFound(hit))
    }

    /// Route a user-facing message; returns false if the job was stopped
    pub fn message(&self, ticket: JobTicket, text: impl Into<String>, level: MessageLevel) -> bool {
        self.send(
            ticket,
            SourceEvent::Message {
                text: text.into(),
                level,
            },
        )
    }

    /// Forward an arbitrary event; returns false if the job was stopped
    pub fn send(&self, ticket: JobTicket, event: SourceEvent) -> bool {
        let state = lock(&self.state);
        if state.generation != ticket.generation {
            return false;
        }
        match &state.sink {
            Some(sink) => {
                // a dropped receiver is not an error for the source
                let _ = sink.send(event);
                true
            }
            None => false,
        }
    }

    /// Complete the job normally
    ///
    /// Returns false if the job had already been stopped.
    pub fn finish(&self, ticket: JobTicket, source_id: &str) -> bool {
        let mut state = lock(&self.state);
        if state.generation != ticket.generation {
            return false;
        }
        // the task is finishing itself; detach rather than abort
        state.task = None;
        match state.sink.take() {
            Some(sink) => {
                let _ = sink.send(SourceEvent::Done {
                    source_id: source_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Cancel the running job
    ///
    /// Returns false if nothing was running.
    pub fn stop(&self, source_id: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(sink) = state.sink.take() else {
            return false;
        };
        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        let _ = sink.send(SourceEvent::Done {
            source_id: source_id.to_string(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<SourceEvent>) -> Vec<SourceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_begin_rejects_second_job() {
        let session = SearchSession::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.begin("s", tx.clone()).unwrap();
        assert!(session.is_searching());

        let err = session.begin("s", tx).unwrap_err();
        assert!(matches!(err, FetchError::AlreadySearching(id) if id == "s"));
    }

    #[test]
    fn test_finish_sends_single_done() {
        let session = SearchSession::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticket = session.begin("s", tx).unwrap();

        assert!(session.hit(ticket, SearchHit::new("s", "A", "")));
        assert!(session.finish(ticket, "s"));
        assert!(!session.finish(ticket, "s"));
        assert!(!session.stop("s"));
        assert!(!session.is_searching());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SourceEvent::HitFound(_)));
        assert!(matches!(&events[1], SourceEvent::Done { source_id } if source_id == "s"));
    }

    #[test]
    fn test_stop_discards_late_events() {
        let session = SearchSession::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticket = session.begin("s", tx).unwrap();

        assert!(session.stop("s"));
        assert!(!session.hit(ticket, SearchHit::new("s", "late", "")));
        assert!(!session.finish(ticket, "s"));
        assert!(!session.is_current(ticket));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SourceEvent::Done { .. }));
    }

    #[test]
    fn test_new_job_after_stop_gets_fresh_ticket() {
        let session = SearchSession::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = session.begin("s", tx.clone()).unwrap();
        session.stop("s");

        let second = session.begin("s", tx).unwrap();
        assert_ne!(first, second);
        assert!(session.is_current(second));
        assert!(!session.is_current(first));
    }

    #[tokio::test]
    async fn test_stop_aborts_spawned_job() {
        let session = std::sync::Arc::new(SearchSession::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticket = session.begin("s", tx).unwrap();

        let job_session = session.clone();
        session.spawn(ticket, async move {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            job_session.hit(ticket, SearchHit::new("s", "never", ""));
            job_session.finish(ticket, "s");
        });

        session.stop("s");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SourceEvent::Done { .. }));
    }
}
