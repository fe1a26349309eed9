//! # Multi-Dimensional Range Search
//!
//! A search carries one [`RangeQuery`] per dimension into the overlay and
//! collects the owners of matching elements. A contact is returned only if
//! it matched in every queried dimension.
//!
//! Responders answer in one of two modes, and a single search accepts both:
//!
//! - **Serial**: per dimension, a sequence of numbered batches. The batch
//!   flagged `last` carries the total count; the dimension is done once that
//!   many batches have arrived, in any order.
//! - **Parallel**: each visited peer reports its own matches for every
//!   dimension plus the set of peers the traversal has visited. The search is
//!   done when every visited peer has answered.
//!
//! With `k > 0`, the search completes as soon as the running intersection
//! reaches `k` contacts and returns exactly the first `k`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{Contact, Identity};
use crate::messages::{
    Message, MessageBody, OperationId, ParallelSearchResult, RangeQuery, SearchQuery,
    SerialSearchResult,
};
use crate::monitor::{HopCounts, OperationReport, SearchReport};
use crate::operation::{
    routing_verdict, OperationError, OperationLogic, OperationStats, Progress, TrackerHandle,
};

#[derive(Debug)]
struct Dimension {
    name: String,
    /// Insertion order is preserved for the final intersection.
    results: Vec<Contact>,
    members: HashSet<Identity>,
    received: u32,
    expected: Option<u32>,
}

impl Dimension {
    fn new(name: String) -> Self {
        Self {
            name,
            results: Vec::new(),
            members: HashSet::new(),
            received: 0,
            expected: None,
        }
    }

    fn absorb(&mut self, contacts: &[Contact]) {
        for contact in contacts {
            if self.members.insert(contact.identity) {
                self.results.push(contact.clone());
            }
        }
    }

    fn serial_complete(&self) -> bool {
        // A zero total never completes through this path.
        matches!(self.expected, Some(expected) if expected > 0 && self.received >= expected)
    }
}

/// Per-dimension result sets and completion bookkeeping for one search.
#[derive(Debug, Default)]
pub struct SearchAccumulator {
    dimensions: Vec<Dimension>,
    index: HashMap<String, usize>,
    visited: HashSet<Identity>,
    answered: HashSet<Identity>,
}

impl SearchAccumulator {
    /// Queries naming the same dimension share one result set.
    pub fn new(queries: &[RangeQuery]) -> Self {
        let mut accumulator = Self::default();
        for query in queries {
            if !accumulator.index.contains_key(&query.dimension) {
                accumulator
                    .index
                    .insert(query.dimension.clone(), accumulator.dimensions.len());
                accumulator
                    .dimensions
                    .push(Dimension::new(query.dimension.clone()));
            }
        }
        accumulator
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(|d| d.name.as_str())
    }

    /// Fold one serial batch in. Returns `false` for a dimension this search
    /// never asked about.
    pub fn merge_serial(&mut self, result: &SerialSearchResult) -> bool {
        let Some(&slot) = self.index.get(&result.dimension) else {
            return false;
        };
        let dimension = &mut self.dimensions[slot];
        dimension.absorb(&result.results);
        dimension.received += 1;
        if result.last {
            dimension.expected = Some(result.counter);
        }
        true
    }

    pub fn merge_parallel(&mut self, result: &ParallelSearchResult) {
        for (name, contacts) in &result.results {
            if let Some(&slot) = self.index.get(name) {
                self.dimensions[slot].absorb(contacts);
            }
        }
        self.visited.extend(result.visited.iter().copied());
        self.visited.insert(result.author);
        self.answered.insert(result.author);
    }

    /// Contacts present in every dimension, in the first dimension's order.
    pub fn intersection(&self) -> Vec<Contact> {
        let Some((first, rest)) = self.dimensions.split_first() else {
            return Vec::new();
        };
        first
            .results
            .iter()
            .filter(|contact| rest.iter().all(|d| d.members.contains(&contact.identity)))
            .cloned()
            .collect()
    }

    pub fn serial_complete(&self) -> bool {
        !self.dimensions.is_empty() && self.dimensions.iter().all(Dimension::serial_complete)
    }

    pub fn parallel_complete(&self) -> bool {
        !self.answered.is_empty() && self.visited.is_subset(&self.answered)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SearchState {
    AwaitingEntryAck,
    Aggregating,
}

pub(crate) struct SearchOperation {
    queries: Vec<RangeQuery>,
    k: usize,
    accumulator: SearchAccumulator,
    state: SearchState,
}

impl SearchOperation {
    pub(crate) fn new(queries: Vec<RangeQuery>, k: usize) -> Self {
        let accumulator = SearchAccumulator::new(&queries);
        Self {
            queries,
            k,
            accumulator,
            state: SearchState::AwaitingEntryAck,
        }
    }

    fn evaluate(&self, complete: bool) -> Progress<Vec<Contact>> {
        let mut found = self.accumulator.intersection();
        if self.k > 0 && found.len() >= self.k {
            found.truncate(self.k);
            trace!(k = self.k, "intersection reached k");
            return Progress::Done(found);
        }
        if complete {
            Progress::Done(found)
        } else {
            Progress::Pending
        }
    }
}

impl OperationLogic for SearchOperation {
    type Output = Vec<Contact>;

    fn kind(&self) -> &'static str {
        "search"
    }

    fn build_body(&self, tracker: &TrackerHandle) -> MessageBody {
        MessageBody::Search(SearchQuery {
            queries: self.queries.clone(),
            tracker: Some(tracker.clone()),
        })
    }

    fn on_reply(&mut self, reply: &Message, stats: &mut OperationStats) -> Progress<Vec<Contact>> {
        let progress = routing_verdict(reply, stats);
        if matches!(progress, Progress::Pending) && self.state == SearchState::AwaitingEntryAck {
            trace!(op = reply.operation_id, "entry point accepted the query");
            self.state = SearchState::Aggregating;
        }
        progress
    }

    fn on_inbound(&mut self, message: Message, _stats: &mut OperationStats) -> Progress<Vec<Contact>> {
        match message.body {
            MessageBody::SerialResult(result) => {
                if !self.accumulator.merge_serial(&result) {
                    debug!(op = message.operation_id, dimension = %result.dimension, "result for unqueried dimension");
                    return Progress::Pending;
                }
                self.evaluate(self.accumulator.serial_complete())
            }
            MessageBody::ParallelResult(result) => {
                self.accumulator.merge_parallel(&result);
                self.evaluate(self.accumulator.parallel_complete())
            }
            other => {
                debug!(op = message.operation_id, body = other.name(), "ignoring unexpected inbound message");
                Progress::Pending
            }
        }
    }

    fn report(
        &self,
        id: OperationId,
        outcome: &Result<Vec<Contact>, OperationError>,
        stats: &OperationStats,
        elapsed: Duration,
    ) -> OperationReport {
        OperationReport::Search(SearchReport {
            operation_id: id,
            success: outcome.is_ok(),
            results: outcome.as_ref().map(Clone::clone).unwrap_or_default(),
            duration: elapsed,
            messages: stats.message_counts(),
            hops: HopCounts::from_path(&stats.hops),
            bootstrap_attempts: stats.bootstrap_attempts,
        })
    }

    fn prepare(&mut self, _tracker: &TrackerHandle, _started: Instant) {
        self.state = SearchState::AwaitingEntryAck;
    }
}
