//! Element announcement and withdrawal.
//!
//! Every element in an update is wired to the operation before the first
//! send. The overlay confirms elements one at a time as it applies them; the
//! update succeeds the moment nothing is left pending, in whatever order the
//! confirmations arrive. An update with no elements succeeds on the entry
//! point's ACK.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::messages::{
    Element, ElementKey, Message, MessageBody, OperationId, UpdateKind, UpdateRequest,
};
use crate::monitor::{HopCounts, OperationReport, UpdateReport};
use crate::operation::{
    routing_verdict, OperationError, OperationLogic, OperationStats, Progress, TrackerHandle,
};

/// Timing of a successful update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateReceipt {
    /// Latency to the first confirmation; `None` for an empty update.
    pub first_confirmation: Option<Duration>,
    pub last_confirmation: Option<Duration>,
    pub confirmed: usize,
}

pub(crate) struct UpdateOperation {
    adds: Vec<Element>,
    deletes: Vec<Element>,
    pending_adds: Vec<Element>,
    pending_deletes: Vec<Element>,
    started: Option<Instant>,
    first_confirmation: Option<Instant>,
    last_confirmation: Option<Instant>,
    confirmed: usize,
}

impl UpdateOperation {
    pub(crate) fn new(adds: Vec<Element>, deletes: Vec<Element>) -> Self {
        Self {
            adds,
            deletes,
            pending_adds: Vec::new(),
            pending_deletes: Vec::new(),
            started: None,
            first_confirmation: None,
            last_confirmation: None,
            confirmed: 0,
        }
    }

    fn settled(&self) -> bool {
        self.pending_adds.is_empty() && self.pending_deletes.is_empty()
    }

    fn since_start(&self, at: Option<Instant>) -> Option<Duration> {
        match (self.started, at) {
            (Some(started), Some(at)) => Some(at.duration_since(started)),
            _ => None,
        }
    }

    fn receipt(&self) -> UpdateReceipt {
        UpdateReceipt {
            first_confirmation: self.since_start(self.first_confirmation),
            last_confirmation: self.since_start(self.last_confirmation),
            confirmed: self.confirmed,
        }
    }
}

impl OperationLogic for UpdateOperation {
    type Output = UpdateReceipt;

    fn kind(&self) -> &'static str {
        "update"
    }

    fn prepare(&mut self, tracker: &TrackerHandle, started: Instant) {
        for element in &mut self.adds {
            element.wire_confirmation(tracker.clone(), UpdateKind::Add);
        }
        for element in &mut self.deletes {
            element.wire_confirmation(tracker.clone(), UpdateKind::Delete);
        }
        self.pending_adds = self.adds.clone();
        self.pending_deletes = self.deletes.clone();
        self.started = Some(started);
    }

    fn build_body(&self, tracker: &TrackerHandle) -> MessageBody {
        MessageBody::Update(UpdateRequest {
            adds: self.adds.clone(),
            deletes: self.deletes.clone(),
            hop_count: 0,
            tracker: Some(tracker.clone()),
        })
    }

    fn on_reply(&mut self, reply: &Message, stats: &mut OperationStats) -> Progress<UpdateReceipt> {
        match routing_verdict(reply, stats) {
            Progress::Pending if self.settled() => Progress::Done(self.receipt()),
            other => other,
        }
    }

    fn on_confirmed(&mut self, key: ElementKey) -> Progress<UpdateReceipt> {
        let pending = match key.kind {
            UpdateKind::Add => &mut self.pending_adds,
            UpdateKind::Delete => &mut self.pending_deletes,
        };
        let Some(position) = pending.iter().position(|e| e.key(key.kind) == key) else {
            trace!(dimension = %key.dimension, value = key.value, "duplicate or unknown confirmation");
            return Progress::Pending;
        };
        pending.remove(position);

        let now = Instant::now();
        self.first_confirmation.get_or_insert(now);
        self.last_confirmation = Some(now);
        self.confirmed += 1;

        if self.settled() {
            Progress::Done(self.receipt())
        } else {
            Progress::Pending
        }
    }

    fn report(
        &self,
        id: OperationId,
        outcome: &Result<UpdateReceipt, OperationError>,
        stats: &OperationStats,
        elapsed: Duration,
    ) -> OperationReport {
        let span = match (self.first_confirmation, self.last_confirmation) {
            (Some(first), Some(last)) => Some(last.duration_since(first)),
            _ => None,
        };
        OperationReport::Update(UpdateReport {
            operation_id: id,
            success: outcome.is_ok(),
            duration: elapsed,
            first_confirmation: self.since_start(self.first_confirmation),
            last_confirmation: self.since_start(self.last_confirmation),
            confirmation_span: span,
            add_hops: HopCounts::from_path(&stats.hops),
            delete_hops: HopCounts::from_path(&stats.delete_hops),
            pending_adds: self.pending_adds.clone(),
            pending_deletes: self.pending_deletes.clone(),
            messages: stats.message_counts(),
            bootstrap_attempts: stats.bootstrap_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::OperationConfig;
    use crate::monitor::MemoryMonitor;
    use crate::operation::{Environment, OperationEvent, OperationRunner};
    use crate::testing::{contact, ScriptedNetwork};

    fn element(value: i64) -> Element {
        Element::new("x", value, contact("owner"))
    }

    fn prepared(adds: Vec<Element>, deletes: Vec<Element>) -> (UpdateOperation, tokio::sync::mpsc::UnboundedReceiver<OperationEvent>) {
        let mut op = UpdateOperation::new(adds, deletes);
        let (tracker, rx) = TrackerHandle::detached();
        op.prepare(&tracker, Instant::now());
        (op, rx)
    }

    fn confirmations(body: &MessageBody) -> Vec<Element> {
        match body {
            MessageBody::Update(update) => update.adds.iter().chain(&update.deletes).cloned().collect(),
            _ => panic!("expected an update body"),
        }
    }

    #[tokio::test]
    async fn elements_are_wired_before_the_first_send() {
        let (op, _rx) = prepared(vec![element(1)], vec![element(2)]);
        let body = op.build_body(&TrackerHandle::detached().0);
        assert!(confirmations(&body).iter().all(Element::is_wired));
    }

    #[tokio::test]
    async fn confirmations_in_any_order_complete_the_update() {
        let (mut op, mut rx) = prepared(vec![element(1), element(2)], vec![]);
        let body = op.build_body(&TrackerHandle::detached().0);
        let elements = confirmations(&body);

        // The overlay confirms the second element first.
        assert!(elements[1].confirm());
        assert!(elements[0].confirm());

        let mut outcomes = Vec::new();
        while let Ok(OperationEvent::Confirmed(key)) = rx.try_recv() {
            outcomes.push(op.on_confirmed(key));
        }
        assert!(matches!(outcomes[0], Progress::Pending));
        match &outcomes[1] {
            Progress::Done(receipt) => assert_eq!(receipt.confirmed, 2),
            _ => panic!("both adds confirmed"),
        }
    }

    #[tokio::test]
    async fn duplicate_confirmations_are_ignored() {
        let (mut op, _rx) = prepared(vec![element(1), element(2)], vec![]);
        let key = element(1).key(UpdateKind::Add);
        assert!(matches!(op.on_confirmed(key.clone()), Progress::Pending));
        assert!(matches!(op.on_confirmed(key), Progress::Pending));
        assert_eq!(op.pending_adds.len(), 1);
    }

    #[tokio::test]
    async fn add_and_delete_of_the_same_element_are_tracked_separately() {
        let (mut op, _rx) = prepared(vec![element(1)], vec![element(1)]);
        assert!(matches!(op.on_confirmed(element(1).key(UpdateKind::Delete)), Progress::Pending));
        assert_eq!(op.pending_adds.len(), 1);
        assert!(matches!(op.on_confirmed(element(1).key(UpdateKind::Add)), Progress::Done(_)));
    }

    #[tokio::test]
    async fn ack_completes_only_a_settled_update() {
        let mut stats = OperationStats::default();
        let request = Message::new(contact("local"), contact("entry"), 1, MessageBody::Ack);
        let ack = request.reply(MessageBody::Ack);

        let (mut empty, _rx) = prepared(vec![], vec![]);
        match empty.on_reply(&ack, &mut stats) {
            Progress::Done(receipt) => assert_eq!(receipt, UpdateReceipt::default()),
            _ => panic!("empty update completes on ACK"),
        }

        let (mut busy, _rx) = prepared(vec![element(7)], vec![]);
        assert!(matches!(busy.on_reply(&ack, &mut stats), Progress::Pending));
        assert!(matches!(busy.on_reply(&request.reply(MessageBody::Nack), &mut stats), Progress::Retry));
    }

    #[tokio::test]
    async fn report_lists_what_is_still_pending() {
        let (mut op, _rx) = prepared(vec![element(1), element(2)], vec![element(3)]);
        op.on_confirmed(element(2).key(UpdateKind::Add));

        let report = op.report(9, &Err(OperationError::TimedOut), &OperationStats::default(), Duration::from_secs(1));
        let OperationReport::Update(report) = report else {
            panic!("update report");
        };
        assert!(!report.success);
        assert_eq!(report.pending_adds, vec![element(1)]);
        assert_eq!(report.pending_deletes, vec![element(3)]);
        assert!(report.first_confirmation.is_some());
        assert_eq!(report.confirmation_span, Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn a_missing_confirmation_fails_at_the_deadline() {
        let network = ScriptedNetwork::new();
        let monitor = Arc::new(MemoryMonitor::new());
        network.set_local_entry(Some(contact("entry")));
        let env = Environment::new(network.clone(), network.clone(), network.clone())
            .with_monitor(monitor.clone())
            .with_config(OperationConfig::default().with_timeout(Duration::from_secs(3)));

        let operation = UpdateOperation::new(vec![element(1), element(2)], vec![]);
        let handle = tokio::spawn(OperationRunner::new(1, operation, env).run());
        network.wait_for_sends(1).await;

        let elements = confirmations(&network.sent()[0].body);
        assert!(elements[0].confirm());
        assert_eq!(handle.await.expect("task"), Err(OperationError::TimedOut));

        // The hook outlives the operation but goes nowhere.
        assert!(!elements[1].confirm());
        let report = monitor.updates().pop().expect("report");
        assert_eq!(report.pending_adds, vec![element(2)]);
        assert_eq!(monitor.len(), 1);
    }
}
