//! # Operation Framework
//!
//! An operation is a retryable, timeout-bounded unit of work started by the
//! application (search, update, join). Each one runs as its own actor:
//!
//! - [`OperationRunner`] owns every piece of mutable state (blacklist, retry
//!   counters, instrumentation, the operation's aggregation state) and
//!   advances only when an [`OperationEvent`] arrives on its channel.
//! - Operation-specific behaviour lives behind [`OperationLogic`], an explicit
//!   state machine fed one event at a time.
//! - Remote collaborators never hold references into the operation. They get
//!   a [`TrackerHandle`] or a [`ReplySink`], both of which only enqueue events.
//!
//! ## Lifecycle
//!
//! ```text
//! execute ─▶ precondition ─▶ dispatch ─▶ await events ─┬─▶ Done     (report once)
//!               │                ▲                     ├─▶ Retry ──┘
//!               └─▶ fail fast    └─────────────────────┴─▶ timeout (report once)
//!                   (no report)
//! ```
//!
//! The whole drive loop sits inside one deadline. When it finishes, for any
//! reason, the event channel is closed; later replies, confirmations and hop
//! reports are dropped by the channel itself.
//!
//! ## Entry points and retries
//!
//! A peer hosting its own skip-graph node sends straight to it. Otherwise a
//! bootstrap identifier is resolved through the DHT; candidates that resolve
//! to nothing usable are blacklisted and replaced immediately without
//! touching the delivery budget. NACKs, unrecognized direct replies and
//! delivery timeouts consume one of `max_number_of_lookups` delivery attempts
//! and blacklist the candidate that led there.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::bootstrap::{BootstrapId, BootstrapResolver};
use crate::config::OperationConfig;
use crate::identity::{Contact, Identity};
use crate::messages::{ElementKey, Message, MessageBody, OperationId};
use crate::monitor::{MessageCounts, OperationReport};
use crate::protocols::{
    DeliveryId, DeliveryOutcome, DhtLookup, DhtObject, LocalOverlay, Monitor, ReplySink, Transport,
};

/// Terminal failure of an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The local peer is not present in the overlay.
    #[error("local peer is not present in the overlay")]
    NotOnline,

    /// The local peer already hosts an overlay node.
    #[error("local peer already hosts an overlay node")]
    AlreadyJoined,

    /// Every bootstrap candidate failed twice over.
    #[error("no bootstrap candidate resolved to an entry point")]
    BootstrapExhausted,

    /// The delivery budget ran out.
    #[error("gave up after {attempts} delivery attempts")]
    RetriesExhausted {
        /// Messages dispatched before giving up.
        attempts: usize,
    },

    /// The operation deadline passed.
    #[error("operation timed out")]
    TimedOut,

    /// The operation task ended without producing an outcome.
    #[error("operation aborted")]
    Aborted,
}

/// Which kind of forwarding step a hop report describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HopKind {
    /// A query or add-element forwarding step.
    Route,
    /// A delete-element forwarding step.
    Delete,
}

#[derive(Debug)]
pub(crate) enum OperationEvent {
    /// Fate of a message this operation dispatched.
    Delivery {
        delivery: DeliveryId,
        outcome: DeliveryOutcome,
    },
    /// An asynchronous message addressed to this operation (results).
    Inbound(Message),
    Hop {
        peer: Identity,
        kind: HopKind,
    },
    ReplySent,
    Confirmed(ElementKey),
}

/// Instrumentation handle attached to outbound messages.
///
/// Peers that forward or answer a message report through it; the owning
/// operation applies the reports to its own counters. Every method returns
/// `false` once the operation has finished.
#[derive(Clone, Debug)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<OperationEvent>,
}

impl TrackerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<OperationEvent>) -> Self {
        Self { tx }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// A query or add-element message was forwarded through `peer`.
    pub fn hop(&self, peer: Identity) -> bool {
        self.tx
            .send(OperationEvent::Hop { peer, kind: HopKind::Route })
            .is_ok()
    }

    /// A delete-element message was forwarded through `peer`.
    pub fn delete_hop(&self, peer: Identity) -> bool {
        self.tx
            .send(OperationEvent::Hop { peer, kind: HopKind::Delete })
            .is_ok()
    }

    /// A responder relayed a result message back to the requester.
    pub fn reply_sent(&self) -> bool {
        self.tx.send(OperationEvent::ReplySent).is_ok()
    }

    pub(crate) fn confirmed(&self, key: ElementKey) -> bool {
        self.tx.send(OperationEvent::Confirmed(key)).is_ok()
    }
}

/// Instrumentation owned by one operation.
#[derive(Clone, Debug, Default)]
pub struct OperationStats {
    /// Messages dispatched to an entry point. Never reset across retries.
    pub bootstrap_messages: u64,
    pub forwarding_messages: u64,
    pub acks: u64,
    pub replies: u64,
    /// DHT lookups issued while acquiring entry points.
    pub bootstrap_attempts: u64,
    /// Peers visited, in report order.
    pub hops: Vec<Identity>,
    pub delete_hops: Vec<Identity>,
}

impl OperationStats {
    pub fn message_counts(&self) -> MessageCounts {
        MessageCounts {
            bootstrap: self.bootstrap_messages,
            forwarding: self.forwarding_messages,
            acks: self.acks,
            replies: self.replies,
        }
    }

    fn record_hop(&mut self, peer: Identity, kind: HopKind) {
        self.forwarding_messages += 1;
        match kind {
            HopKind::Route => self.hops.push(peer),
            HopKind::Delete => self.delete_hops.push(peer),
        }
    }
}

/// Collaborators shared by every operation a node runs.
#[derive(Clone)]
pub struct Environment {
    pub overlay: Arc<dyn LocalOverlay>,
    pub dht: Arc<dyn DhtLookup>,
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<BootstrapResolver>,
    pub monitor: Option<Arc<dyn Monitor>>,
    pub config: OperationConfig,
}

impl Environment {
    pub fn new(
        overlay: Arc<dyn LocalOverlay>,
        dht: Arc<dyn DhtLookup>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            overlay,
            dht,
            transport,
            resolver: Arc::new(BootstrapResolver::new()),
            monitor: None,
            config: OperationConfig::default(),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<BootstrapResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_config(mut self, config: OperationConfig) -> Self {
        self.config = config;
        self
    }
}

/// Result of feeding one event to an operation.
pub(crate) enum Progress<T> {
    Pending,
    Retry,
    Done(T),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryPolicy {
    /// Use the local skip-graph node when there is one.
    LocalFirst,
    AlwaysBootstrap,
}

pub(crate) trait OperationLogic: Send + 'static {
    type Output: Send + 'static;

    fn kind(&self) -> &'static str;

    fn entry_policy(&self) -> EntryPolicy {
        EntryPolicy::LocalFirst
    }

    fn check_precondition(&self, overlay: &dyn LocalOverlay) -> Result<(), OperationError> {
        if overlay.is_online() {
            Ok(())
        } else {
            Err(OperationError::NotOnline)
        }
    }

    /// Called once, after the precondition holds and before the first send.
    fn prepare(&mut self, _tracker: &TrackerHandle, _started: Instant) {}

    fn build_body(&self, tracker: &TrackerHandle) -> MessageBody;

    /// Direct reply to the message most recently dispatched.
    fn on_reply(&mut self, reply: &Message, stats: &mut OperationStats) -> Progress<Self::Output>;

    fn on_inbound(&mut self, message: Message, _stats: &mut OperationStats) -> Progress<Self::Output> {
        debug!(kind = self.kind(), body = message.body.name(), "ignoring unexpected inbound message");
        Progress::Pending
    }

    fn on_confirmed(&mut self, _key: ElementKey) -> Progress<Self::Output> {
        Progress::Pending
    }

    /// The bootstrap pool is empty: no overlay node exists at all.
    fn on_empty_pool(&mut self) -> Option<Self::Output> {
        None
    }

    fn report(
        &self,
        id: OperationId,
        outcome: &Result<Self::Output, OperationError>,
        stats: &OperationStats,
        elapsed: Duration,
    ) -> OperationReport;
}

/// Shared handling of the routing verdict for search and update dispatches.
pub(crate) fn routing_verdict<T>(reply: &Message, stats: &mut OperationStats) -> Progress<T> {
    match &reply.body {
        MessageBody::Ack => {
            stats.acks += 1;
            Progress::Pending
        }
        body if body.is_nack() => Progress::Retry,
        body => {
            debug!(op = reply.operation_id, body = body.name(), "unrecognized reply to dispatch");
            Progress::Retry
        }
    }
}

enum Entry {
    Contact(Contact),
    EmptyPool,
}

pub(crate) struct OperationRunner<L: OperationLogic> {
    id: OperationId,
    logic: L,
    env: Environment,
    stats: OperationStats,
    blacklist: HashSet<BootstrapId>,
    current_bootstrap: Option<BootstrapId>,
    current_delivery: Option<DeliveryId>,
    delivery_attempts: usize,
    tracker: TrackerHandle,
    events_tx: mpsc::UnboundedSender<OperationEvent>,
    events: mpsc::UnboundedReceiver<OperationEvent>,
}

impl<L: OperationLogic> OperationRunner<L> {
    pub(crate) fn new(id: OperationId, logic: L, env: Environment) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            id,
            logic,
            env,
            stats: OperationStats::default(),
            blacklist: HashSet::new(),
            current_bootstrap: None,
            current_delivery: None,
            delivery_attempts: 0,
            tracker: TrackerHandle::new(events_tx.clone()),
            events_tx,
            events,
        }
    }

    /// Sender for routing inbound messages to this operation.
    pub(crate) fn inbox(&self) -> mpsc::UnboundedSender<OperationEvent> {
        self.events_tx.clone()
    }

    /// Execute the operation to completion. The returned outcome is the only
    /// one this operation ever produces.
    pub(crate) async fn run(mut self) -> Result<L::Output, OperationError> {
        let kind = self.logic.kind();
        if let Err(e) = self.logic.check_precondition(self.env.overlay.as_ref()) {
            debug!(op = self.id, kind, error = %e, "precondition failed");
            self.events.close();
            return Err(e);
        }

        let started = Instant::now();
        let deadline = started + self.env.config.operation_timeout;
        let tracker = self.tracker.clone();
        self.logic.prepare(&tracker, started);

        let outcome = match timeout_at(deadline, self.drive()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(op = self.id, kind, attempts = self.delivery_attempts, "operation timed out");
                Err(OperationError::TimedOut)
            }
        };
        self.events.close();

        match &outcome {
            Ok(_) => debug!(op = self.id, kind, "operation succeeded"),
            Err(e) => debug!(op = self.id, kind, error = %e, "operation failed"),
        }

        if let Some(monitor) = &self.env.monitor {
            let report = self.logic.report(self.id, &outcome, &self.stats, started.elapsed());
            monitor.operation_completed(report);
        }
        outcome
    }

    async fn drive(&mut self) -> Result<L::Output, OperationError> {
        if let Some(output) = self.dispatch().await? {
            return Ok(output);
        }

        loop {
            let Some(event) = self.events.recv().await else {
                return Err(OperationError::Aborted);
            };

            let progress = match event {
                OperationEvent::Delivery { delivery, outcome } => {
                    if self.current_delivery != Some(delivery) {
                        trace!(op = self.id, delivery, "ignoring stale delivery outcome");
                        continue;
                    }
                    match outcome {
                        DeliveryOutcome::Reply(reply) => self.logic.on_reply(&reply, &mut self.stats),
                        DeliveryOutcome::TimedOut => {
                            debug!(op = self.id, delivery, "delivery timed out");
                            Progress::Retry
                        }
                    }
                }
                OperationEvent::Inbound(message) => self.logic.on_inbound(message, &mut self.stats),
                OperationEvent::Hop { peer, kind } => {
                    self.stats.record_hop(peer, kind);
                    Progress::Pending
                }
                OperationEvent::ReplySent => {
                    self.stats.replies += 1;
                    Progress::Pending
                }
                OperationEvent::Confirmed(key) => self.logic.on_confirmed(key),
            };

            match progress {
                Progress::Pending => {}
                Progress::Done(output) => return Ok(output),
                Progress::Retry => {
                    if let Some(output) = self.retry().await? {
                        return Ok(output);
                    }
                }
            }
        }
    }

    async fn retry(&mut self) -> Result<Option<L::Output>, OperationError> {
        if self.delivery_attempts >= self.env.config.max_number_of_lookups {
            warn!(
                op = self.id,
                kind = self.logic.kind(),
                attempts = self.delivery_attempts,
                "delivery budget exhausted"
            );
            return Err(OperationError::RetriesExhausted {
                attempts: self.delivery_attempts,
            });
        }
        if let Some(id) = self.current_bootstrap.take() {
            debug!(op = self.id, bootstrap = ?id, "blacklisting bootstrap candidate");
            self.blacklist.insert(id);
        }
        self.dispatch().await
    }

    async fn dispatch(&mut self) -> Result<Option<L::Output>, OperationError> {
        let entry = match self.to_entry_point().await? {
            Entry::Contact(contact) => contact,
            Entry::EmptyPool => {
                return match self.logic.on_empty_pool() {
                    Some(output) => Ok(Some(output)),
                    None => Err(OperationError::BootstrapExhausted),
                };
            }
        };

        let body = self.logic.build_body(&self.tracker);
        let message = Message::new(self.env.overlay.local_contact(), entry, self.id, body);
        self.delivery_attempts += 1;
        self.stats.bootstrap_messages += 1;

        debug!(
            op = self.id,
            kind = self.logic.kind(),
            attempt = self.delivery_attempts,
            to = %message.receiver.identity,
            size = message.size(),
            "dispatching"
        );
        let sink = ReplySink::new(self.events_tx.clone());
        self.current_delivery = Some(self.env.transport.send(message, Some(sink)));
        Ok(None)
    }

    async fn to_entry_point(&mut self) -> Result<Entry, OperationError> {
        if self.logic.entry_policy() == EntryPolicy::LocalFirst {
            if let Some(local) = self.env.overlay.local_entry_node() {
                trace!(op = self.id, "using local entry node");
                self.current_bootstrap = None;
                return Ok(Entry::Contact(local));
            }
        }

        let mut recycled = false;
        loop {
            let population = self.env.overlay.population();
            let Some(resolution) = self
                .env
                .resolver
                .resolve_entry_point(population, &mut self.blacklist)
            else {
                debug!(op = self.id, "bootstrap pool is empty");
                return Ok(Entry::EmptyPool);
            };

            if resolution.recycled {
                if recycled {
                    warn!(op = self.id, population, "every bootstrap candidate failed");
                    return Err(OperationError::BootstrapExhausted);
                }
                debug!(op = self.id, population, "bootstrap blacklist covered the pool, recycling");
                recycled = true;
            }

            self.stats.bootstrap_attempts += 1;
            match self.env.dht.lookup(resolution.id).await {
                Ok(Some(DhtObject::EntryPoint(contact))) => {
                    trace!(op = self.id, bootstrap = ?resolution.id, entry = %contact.identity, "entry point resolved");
                    self.current_bootstrap = Some(resolution.id);
                    return Ok(Entry::Contact(contact));
                }
                Ok(Some(DhtObject::Opaque(_))) => {
                    debug!(op = self.id, bootstrap = ?resolution.id, "bootstrap key holds a foreign object");
                }
                Ok(None) => {
                    debug!(op = self.id, bootstrap = ?resolution.id, "bootstrap key unresolved");
                }
                Err(e) => {
                    debug!(op = self.id, bootstrap = ?resolution.id, error = %e, "bootstrap lookup failed");
                }
            }
            self.blacklist.insert(resolution.id);
        }
    }
}
