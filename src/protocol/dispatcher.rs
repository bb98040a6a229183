use crate::core::vote::Vote;
use crate::error::{constants, HandlerError, ProtocolError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type HandlerFn = dyn Fn(&Vote) -> std::result::Result<(), HandlerError> + Send + Sync + 'static;

/// Where a listener delivers decoded votes.
///
/// Called synchronously from the connection handler; the return value is not
/// consumed, so implementations own their failure reporting.
pub trait VoteSink: Send + Sync {
    fn publish(&self, vote: Vote);
}

/// Opaque mirror of votes to an external bus.
///
/// Invoked after the local handlers. Its transport and delivery semantics
/// are its own; failures are logged and otherwise ignored.
pub trait ForwardingSink: Send + Sync {
    fn forward(&self, vote: &Vote) -> std::result::Result<(), HandlerError>;
}

/// Identity returned by [`EventDispatcher::register_handler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Outcome of one [`EventDispatcher::publish`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
    pub forwarded: bool,
}

/// Fan-out of votes to registered handlers.
///
/// Handlers run in registration order. Each one is isolated: an error or a
/// panic is counted and logged, and the remaining handlers still run.
/// Delivery is at-most-once; nothing is retried.
pub struct EventDispatcher {
    handlers: Arc<RwLock<Vec<(HandlerId, Arc<HandlerFn>)>>>,
    forwarding: RwLock<Option<Arc<dyn ForwardingSink>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    failures: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            forwarding: RwLock::new(None),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn register_handler<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Vote) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        handlers.push((id, Arc::new(handler)));
        debug!(handler = id.0, "Vote handler registered");
        Ok(id)
    }

    /// Remove a handler. Returns false if `id` was not registered.
    pub fn unregister_handler(&self, id: HandlerId) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;

        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        Ok(handlers.len() != before)
    }

    pub fn set_forwarding_sink(&self, sink: Arc<dyn ForwardingSink>) -> Result<()> {
        let mut slot = self
            .forwarding
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;
        *slot = Some(sink);
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    /// Deliver `vote` to every handler, then to the forwarding sink.
    pub fn publish(&self, vote: &Vote) -> PublishReport {
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot so handlers may (un)register without deadlocking.
        let handlers: Vec<_> = match self.handlers.read() {
            Ok(handlers) => handlers.iter().cloned().collect(),
            Err(_) => {
                warn!("{}", constants::ERR_DISPATCHER_READ_LOCK);
                return PublishReport::default();
            }
        };

        let mut report = PublishReport::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(vote))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(handler = id.0, error = %e, "Vote handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(handler = id.0, "Vote handler panicked");
                }
            }
        }

        let sink = self.forwarding.read().ok().and_then(|slot| slot.clone());
        if let Some(sink) = sink {
            match catch_unwind(AssertUnwindSafe(|| sink.forward(vote))) {
                Ok(Ok(())) => report.forwarded = true,
                Ok(Err(e)) => warn!(error = %e, "Vote forwarding failed"),
                Err(_) => warn!("Vote forwarding panicked"),
            }
        }

        self.failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    /// Votes published and handler failures so far
    pub fn stats(&self) -> (u64, u64) {
        (
            self.published.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

impl VoteSink for EventDispatcher {
    fn publish(&self, vote: Vote) {
        EventDispatcher::publish(self, &vote);
    }
}

/// Queued delivery: the listener enqueues, a worker task publishes.
///
/// Bounded; when full the vote is dropped with a warning.
pub struct VoteQueue {
    tx: mpsc::Sender<Vote>,
    dropped: AtomicU64,
}

impl VoteQueue {
    /// Start the worker on the current runtime.
    pub fn spawn(dispatcher: Arc<EventDispatcher>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vote>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(vote) = rx.recv().await {
                dispatcher.publish(&vote);
            }
            debug!("Vote queue closed");
        });
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl VoteSink for VoteQueue {
    fn publish(&self, vote: Vote) {
        if let Err(e) = self.tx.try_send(vote) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let vote = e.into_inner();
            warn!(
                service = vote.service_name(),
                username = vote.username(),
                "Vote queue unavailable; vote dropped"
            );
        }
    }
}

/// Forwarding sink that hands each vote's JSON form to a channel.
///
/// The receiving end belongs to whatever bus client the host runs.
pub struct ChannelForwarder {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelForwarder {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ForwardingSink for ChannelForwarder {
    fn forward(&self, vote: &Vote) -> std::result::Result<(), HandlerError> {
        let json = vote.to_json().map_err(|e| HandlerError::new(e.to_string()))?;
        self.tx
            .send(json)
            .map_err(|_| HandlerError::new("forwarding channel closed"))
    }
}
