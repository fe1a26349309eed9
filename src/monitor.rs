//! # Operation Statistics
//!
//! Every operation that gets past its precondition reports exactly once to
//! the configured [`Monitor`]. Reports are plain values; the monitor is
//! best-effort and never influences protocol behaviour.
//!
//! - [`TracingMonitor`] logs each report at `info`.
//! - [`MemoryMonitor`] keeps reports for later inspection (tests, the demo
//!   binary's summary).
//!
//! A pair of monitors is itself a monitor that forwards every report to both.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::identity::{Contact, Identity};
use crate::messages::{Element, OperationId};
use crate::protocols::Monitor;

/// Messages attributed to one operation, by category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageCounts {
    /// Messages the operation itself dispatched to an entry point.
    pub bootstrap: u64,
    /// Forwarding steps taken by those messages inside the overlay.
    pub forwarding: u64,
    /// Routing acknowledgements received.
    pub acks: u64,
    /// Result messages relayed back by responders.
    pub replies: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HopCounts {
    pub total: usize,
    pub distinct: usize,
}

impl HopCounts {
    pub fn from_path(path: &[Identity]) -> Self {
        Self {
            total: path.len(),
            distinct: path.iter().collect::<HashSet<_>>().len(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchReport {
    pub operation_id: OperationId,
    pub success: bool,
    /// Final intersection; empty on failure.
    pub results: Vec<Contact>,
    pub duration: Duration,
    pub messages: MessageCounts,
    pub hops: HopCounts,
    pub bootstrap_attempts: u64,
}

#[derive(Clone, Debug)]
pub struct UpdateReport {
    pub operation_id: OperationId,
    pub success: bool,
    pub duration: Duration,
    /// Latency from start to the first confirmation.
    pub first_confirmation: Option<Duration>,
    /// Latency from start to the latest confirmation.
    pub last_confirmation: Option<Duration>,
    /// Time between the first and latest confirmation.
    pub confirmation_span: Option<Duration>,
    pub add_hops: HopCounts,
    pub delete_hops: HopCounts,
    /// Elements still unconfirmed when the operation ended.
    pub pending_adds: Vec<Element>,
    pub pending_deletes: Vec<Element>,
    pub messages: MessageCounts,
    pub bootstrap_attempts: u64,
}

#[derive(Clone, Debug)]
pub struct JoinReport {
    pub operation_id: OperationId,
    pub success: bool,
    pub duration: Duration,
    /// The peer found no overlay and starts it.
    pub first_node: bool,
    pub messages: MessageCounts,
    pub bootstrap_attempts: u64,
}

#[derive(Clone, Debug)]
pub enum OperationReport {
    Search(SearchReport),
    Update(UpdateReport),
    Join(JoinReport),
}

impl OperationReport {
    pub fn operation_id(&self) -> OperationId {
        match self {
            OperationReport::Search(r) => r.operation_id,
            OperationReport::Update(r) => r.operation_id,
            OperationReport::Join(r) => r.operation_id,
        }
    }

    pub fn success(&self) -> bool {
        match self {
            OperationReport::Search(r) => r.success,
            OperationReport::Update(r) => r.success,
            OperationReport::Join(r) => r.success,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OperationReport::Search(_) => "search",
            OperationReport::Update(_) => "update",
            OperationReport::Join(_) => "join",
        }
    }
}

/// Logs every report through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn operation_completed(&self, report: OperationReport) {
        match &report {
            OperationReport::Search(r) => info!(
                op = r.operation_id,
                success = r.success,
                results = r.results.len(),
                duration_ms = r.duration.as_millis() as u64,
                hops = r.hops.total,
                distinct_hops = r.hops.distinct,
                bootstrap_attempts = r.bootstrap_attempts,
                messages = ?r.messages,
                "search completed"
            ),
            OperationReport::Update(r) => info!(
                op = r.operation_id,
                success = r.success,
                duration_ms = r.duration.as_millis() as u64,
                first_confirmation_ms = ?r.first_confirmation.map(|d| d.as_millis() as u64),
                last_confirmation_ms = ?r.last_confirmation.map(|d| d.as_millis() as u64),
                add_hops = r.add_hops.total,
                delete_hops = r.delete_hops.total,
                pending = r.pending_adds.len() + r.pending_deletes.len(),
                "update completed"
            ),
            OperationReport::Join(r) => info!(
                op = r.operation_id,
                success = r.success,
                first_node = r.first_node,
                duration_ms = r.duration.as_millis() as u64,
                bootstrap_attempts = r.bootstrap_attempts,
                "join completed"
            ),
        }
    }
}

/// Collects reports in memory.
#[derive(Debug, Default)]
pub struct MemoryMonitor {
    reports: Mutex<Vec<OperationReport>>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<OperationReport> {
        match self.reports.lock() {
            Ok(reports) => reports.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.reports().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn searches(&self) -> Vec<SearchReport> {
        self.reports()
            .into_iter()
            .filter_map(|r| match r {
                OperationReport::Search(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<UpdateReport> {
        self.reports()
            .into_iter()
            .filter_map(|r| match r {
                OperationReport::Update(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    pub fn joins(&self) -> Vec<JoinReport> {
        self.reports()
            .into_iter()
            .filter_map(|r| match r {
                OperationReport::Join(j) => Some(j),
                _ => None,
            })
            .collect()
    }
}

impl Monitor for MemoryMonitor {
    fn operation_completed(&self, report: OperationReport) {
        match self.reports.lock() {
            Ok(mut reports) => reports.push(report),
            Err(poisoned) => poisoned.into_inner().push(report),
        }
    }
}

impl<M: Monitor + ?Sized> Monitor for Arc<M> {
    fn operation_completed(&self, report: OperationReport) {
        (**self).operation_completed(report);
    }
}

impl<A: Monitor, B: Monitor> Monitor for (A, B) {
    fn operation_completed(&self, report: OperationReport) {
        self.0.operation_completed(report.clone());
        self.1.operation_completed(report);
    }
}
