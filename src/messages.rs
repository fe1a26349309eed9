//! # Protocol Messages
//!
//! This module defines the closed set of messages exchanged by skip-graph
//! operations, together with the two contracts every message honours:
//!
//! - **Deep copy**: `Clone` produces a structurally independent duplicate.
//!   Every field is owned, so mutating a clone never reaches the original.
//!   The only shared parts are instrumentation handles ([`TrackerHandle`]),
//!   which are channels back to the issuing operation and carry no message
//!   state.
//! - **Wire size**: [`Message::size`] is a deterministic byte count used for
//!   bandwidth accounting. No byte layout is implied.
//!
//! ## Size accounting
//!
//! | Field | Bytes |
//! |-------|-------|
//! | message framing | `MESSAGE_BASE_SIZE` |
//! | identity | 32 |
//! | operation id, timestamp, element value, range bound | 8 |
//! | counter, hop count | 4 |
//! | flag, optional-presence marker | 1 |
//! | string | 2 × characters |
//! | collection | sum of its elements |
//!
//! Instrumentation handles are never counted.
//!
//! ## Message Types
//!
//! | Body | Direction |
//! |------|-----------|
//! | `Search` | requester → entry point |
//! | `SerialResult` / `ParallelResult` | responder → requester |
//! | `Update` | requester → entry point |
//! | `JoinRequest` / `JoinAck` / `JoinNack` | joining peer ↔ entry point |
//! | `Ack` / `Nack` | entry point → requester (routing verdict) |

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::{Contact, Identity};
use crate::operation::TrackerHandle;

/// Locally unique identifier correlating a request with its replies.
pub type OperationId = u64;

/// Framing overhead charged once per message (type tag and length).
pub const MESSAGE_BASE_SIZE: usize = 4;

const IDENTITY_SIZE: usize = 32;
const OPERATION_ID_SIZE: usize = 8;
const TIMESTAMP_SIZE: usize = 8;
const VALUE_SIZE: usize = 8;
const COUNTER_SIZE: usize = 4;
const FLAG_SIZE: usize = 1;

/// Byte count of an item on the simulated wire.
pub trait WireSize {
    fn wire_size(&self) -> usize;
}

/// Strings are charged two bytes per character.
#[inline]
pub fn string_size(s: &str) -> usize {
    2 * s.chars().count()
}

impl WireSize for Identity {
    fn wire_size(&self) -> usize {
        IDENTITY_SIZE
    }
}

impl WireSize for Contact {
    fn wire_size(&self) -> usize {
        IDENTITY_SIZE + self.addrs.iter().map(|a| string_size(a)).sum::<usize>()
    }
}

impl<T: WireSize> WireSize for [T] {
    fn wire_size(&self) -> usize {
        self.iter().map(WireSize::wire_size).sum()
    }
}

impl<T: WireSize> WireSize for Vec<T> {
    fn wire_size(&self) -> usize {
        self.as_slice().wire_size()
    }
}

/// Milliseconds since the Unix epoch, used to stamp outbound messages.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Payload Types
// ============================================================================

/// An inclusive range over one dimension. `upper == None` is unbounded above.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeQuery {
    pub dimension: String,
    pub lower: i64,
    pub upper: Option<i64>,
}

impl RangeQuery {
    pub fn new(dimension: impl Into<String>, lower: i64, upper: Option<i64>) -> Self {
        Self {
            dimension: dimension.into(),
            lower,
            upper,
        }
    }

    /// Query for every value at or above `lower`.
    pub fn at_least(dimension: impl Into<String>, lower: i64) -> Self {
        Self::new(dimension, lower, None)
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.lower && self.upper.map_or(true, |upper| value <= upper)
    }
}

impl WireSize for RangeQuery {
    fn wire_size(&self) -> usize {
        string_size(&self.dimension)
            + VALUE_SIZE
            + FLAG_SIZE
            + self.upper.map_or(0, |_| VALUE_SIZE)
    }
}

/// Which pending list an element belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Add,
    Delete,
}

/// Identifies an element inside a confirmation event.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ElementKey {
    pub kind: UpdateKind,
    pub dimension: String,
    pub value: i64,
    pub owner: Identity,
}

/// Hook wired into an element before its update is first sent.
#[derive(Clone, Debug)]
pub struct ConfirmationHook {
    tracker: TrackerHandle,
    kind: UpdateKind,
}

/// A single `(dimension, value, owner)` record announced to or withdrawn
/// from the skip graph.
#[derive(Clone, Debug)]
pub struct Element {
    pub dimension: String,
    pub value: i64,
    pub owner: Contact,
    hook: Option<ConfirmationHook>,
}

impl Element {
    pub fn new(dimension: impl Into<String>, value: i64, owner: Contact) -> Self {
        Self {
            dimension: dimension.into(),
            value,
            owner,
            hook: None,
        }
    }

    pub(crate) fn wire_confirmation(&mut self, tracker: TrackerHandle, kind: UpdateKind) {
        self.hook = Some(ConfirmationHook { tracker, kind });
    }

    pub fn is_wired(&self) -> bool {
        self.hook.is_some()
    }

    pub fn key(&self, kind: UpdateKind) -> ElementKey {
        ElementKey {
            kind,
            dimension: self.dimension.clone(),
            value: self.value,
            owner: self.owner.identity,
        }
    }

    /// Report that the overlay has applied this element.
    ///
    /// Returns `false` if the element was never wired or its operation has
    /// already finished.
    pub fn confirm(&self) -> bool {
        match &self.hook {
            Some(hook) => hook.tracker.confirmed(self.key(hook.kind)),
            None => false,
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.dimension == other.dimension && self.value == other.value && self.owner == other.owner
    }
}

impl Eq for Element {}

impl WireSize for Element {
    fn wire_size(&self) -> usize {
        string_size(&self.dimension) + VALUE_SIZE + self.owner.wire_size()
    }
}

// ============================================================================
// Message Bodies
// ============================================================================

#[derive(Clone, Debug)]
pub struct SearchQuery {
    pub queries: Vec<RangeQuery>,
    /// Instrumentation back to the issuing operation. Not on the wire.
    pub tracker: Option<TrackerHandle>,
}

impl WireSize for SearchQuery {
    fn wire_size(&self) -> usize {
        self.queries.wire_size()
    }
}

/// One reply in a per-dimension stream of results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialSearchResult {
    pub dimension: String,
    pub results: Vec<Contact>,
    pub counter: u32,
    /// No further replies follow for this dimension.
    pub last: bool,
}

impl WireSize for SerialSearchResult {
    fn wire_size(&self) -> usize {
        string_size(&self.dimension) + self.results.wire_size() + COUNTER_SIZE + FLAG_SIZE
    }
}

/// One responder's partial result covering any number of dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParallelSearchResult {
    pub results: BTreeMap<String, Vec<Contact>>,
    /// Peers the query had visited when this reply was authored.
    pub visited: BTreeSet<Identity>,
    pub author: Identity,
}

impl WireSize for ParallelSearchResult {
    fn wire_size(&self) -> usize {
        let results: usize = self
            .results
            .iter()
            .map(|(dimension, contacts)| string_size(dimension) + contacts.wire_size())
            .sum();
        let visited: usize = self.visited.iter().map(WireSize::wire_size).sum();
        results + visited + self.author.wire_size()
    }
}

#[derive(Clone, Debug)]
pub struct UpdateRequest {
    pub adds: Vec<Element>,
    pub deletes: Vec<Element>,
    /// Incremented by every peer that forwards the message.
    pub hop_count: u32,
    /// Instrumentation back to the issuing operation. Not on the wire.
    pub tracker: Option<TrackerHandle>,
}

impl UpdateRequest {
    pub fn record_hop(&mut self) {
        self.hop_count = self.hop_count.saturating_add(1);
    }
}

impl WireSize for UpdateRequest {
    fn wire_size(&self) -> usize {
        self.adds.wire_size() + self.deletes.wire_size() + COUNTER_SIZE
    }
}

#[derive(Clone, Debug)]
pub enum MessageBody {
    Search(SearchQuery),
    SerialResult(SerialSearchResult),
    ParallelResult(ParallelSearchResult),
    Update(UpdateRequest),
    JoinRequest,
    JoinAck,
    /// `overlay_reachable == false` means no overlay node exists at all,
    /// as opposed to this particular peer not being one.
    JoinNack {
        overlay_reachable: bool,
    },
    Ack,
    Nack,
}

impl MessageBody {
    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::Search(_) => "search",
            MessageBody::SerialResult(_) => "serial-result",
            MessageBody::ParallelResult(_) => "parallel-result",
            MessageBody::Update(_) => "update",
            MessageBody::JoinRequest => "join-request",
            MessageBody::JoinAck => "join-ack",
            MessageBody::JoinNack { .. } => "join-nack",
            MessageBody::Ack => "ack",
            MessageBody::Nack => "nack",
        }
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, MessageBody::Nack | MessageBody::JoinNack { .. })
    }
}

impl WireSize for MessageBody {
    fn wire_size(&self) -> usize {
        match self {
            MessageBody::Search(query) => query.wire_size(),
            MessageBody::SerialResult(result) => result.wire_size(),
            MessageBody::ParallelResult(result) => result.wire_size(),
            MessageBody::Update(update) => update.wire_size(),
            MessageBody::JoinNack { .. } => FLAG_SIZE,
            MessageBody::JoinRequest | MessageBody::JoinAck | MessageBody::Ack | MessageBody::Nack => 0,
        }
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

#[derive(Clone, Debug)]
pub struct Message {
    pub sender: Contact,
    pub receiver: Contact,
    pub operation_id: OperationId,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub body: MessageBody,
}

impl Message {
    pub fn new(sender: Contact, receiver: Contact, operation_id: OperationId, body: MessageBody) -> Self {
        Self {
            sender,
            receiver,
            operation_id,
            timestamp: now_millis(),
            body,
        }
    }

    /// Build a reply travelling back along this message's path.
    pub fn reply(&self, body: MessageBody) -> Self {
        Self::new(self.receiver.clone(), self.sender.clone(), self.operation_id, body)
    }

    /// Logical size of this message in bytes.
    pub fn size(&self) -> usize {
        MESSAGE_BASE_SIZE
            + self.sender.wire_size()
            + self.receiver.wire_size()
            + OPERATION_ID_SIZE
            + TIMESTAMP_SIZE
            + self.body.wire_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(label: &str) -> Contact {
        Contact::single(Identity::derive(label.as_bytes()), "10.0.0.1:4000")
    }

    fn envelope(body: MessageBody) -> Message {
        Message::new(contact("sender"), contact("receiver"), 7, body)
    }

    fn header_size() -> usize {
        // contact = 32 + 2 * len("10.0.0.1:4000") = 32 + 26
        MESSAGE_BASE_SIZE + 2 * (32 + 26) + 8 + 8
    }

    #[test]
    fn strings_count_two_bytes_per_character() {
        assert_eq!(string_size(""), 0);
        assert_eq!(string_size("cpu"), 6);
        assert_eq!(string_size("résumé"), 12);
    }

    #[test]
    fn empty_bodies_cost_only_the_header() {
        assert_eq!(envelope(MessageBody::Ack).size(), header_size());
        assert_eq!(envelope(MessageBody::Nack).size(), header_size());
        assert_eq!(envelope(MessageBody::JoinRequest).size(), header_size());
        assert_eq!(
            envelope(MessageBody::JoinNack { overlay_reachable: true }).size(),
            header_size() + 1
        );
    }

    #[test]
    fn search_size_sums_queries_and_ignores_tracker() {
        let query = SearchQuery {
            queries: vec![
                RangeQuery::new("cpu", 2, Some(8)),
                RangeQuery::at_least("ram", 1024),
            ],
            tracker: None,
        };
        let expected = header_size() + (6 + 8 + 1 + 8) + (6 + 8 + 1);
        assert_eq!(envelope(MessageBody::Search(query.clone())).size(), expected);

        let (tracker, _rx) = TrackerHandle::detached();
        let tracked = SearchQuery {
            tracker: Some(tracker),
            ..query
        };
        assert_eq!(envelope(MessageBody::Search(tracked)).size(), expected);
    }

    #[test]
    fn serial_result_size() {
        let result = SerialSearchResult {
            dimension: "cpu".into(),
            results: vec![contact("a"), contact("b")],
            counter: 3,
            last: true,
        };
        let expected = header_size() + 6 + 2 * (32 + 26) + 4 + 1;
        assert_eq!(envelope(MessageBody::SerialResult(result)).size(), expected);
    }

    #[test]
    fn parallel_result_size() {
        let mut results = BTreeMap::new();
        results.insert("cpu".to_string(), vec![contact("a")]);
        results.insert("disk".to_string(), vec![]);
        let result = ParallelSearchResult {
            results,
            visited: [Identity::derive(b"a"), Identity::derive(b"b")].into_iter().collect(),
            author: Identity::derive(b"a"),
        };
        let expected = header_size() + (6 + 58) + 8 + 2 * 32 + 32;
        assert_eq!(envelope(MessageBody::ParallelResult(result)).size(), expected);
    }

    #[test]
    fn appending_an_element_grows_size_by_exactly_its_own_size() {
        let mut update = UpdateRequest {
            adds: vec![],
            deletes: vec![],
            hop_count: 0,
            tracker: None,
        };
        let base = envelope(MessageBody::Update(update.clone())).size();

        let added = Element::new("cpu", 4, contact("owner"));
        update.adds.push(added.clone());
        let after_add = envelope(MessageBody::Update(update.clone())).size();
        assert_eq!(after_add, base + added.wire_size());

        let deleted = Element::new("memory", 2048, contact("owner"));
        update.deletes.push(deleted.clone());
        let after_delete = envelope(MessageBody::Update(update)).size();
        assert_eq!(after_delete, after_add + deleted.wire_size());
        assert!(after_delete > after_add && after_add > base);
    }

    #[test]
    fn hop_count_does_not_change_size() {
        let mut update = UpdateRequest {
            adds: vec![Element::new("cpu", 1, contact("o"))],
            deletes: vec![],
            hop_count: 0,
            tracker: None,
        };
        let before = update.wire_size();
        update.record_hop();
        update.record_hop();
        assert_eq!(update.hop_count, 2);
        assert_eq!(update.wire_size(), before);
    }

    #[test]
    fn search_copy_is_isolated() {
        let original = envelope(MessageBody::Search(SearchQuery {
            queries: vec![RangeQuery::new("cpu", 1, Some(2))],
            tracker: None,
        }));
        let mut copy = original.clone();
        copy.sender.addrs.push("192.168.0.1:1".into());
        copy.operation_id = 99;
        if let MessageBody::Search(query) = &mut copy.body {
            query.queries[0].lower = 50;
            query.queries.push(RangeQuery::at_least("ram", 1));
        }

        assert_eq!(original.sender.addrs.len(), 1);
        assert_eq!(original.operation_id, 7);
        match &original.body {
            MessageBody::Search(query) => {
                assert_eq!(query.queries.len(), 1);
                assert_eq!(query.queries[0].lower, 1);
            }
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    fn result_copies_are_isolated() {
        let serial = SerialSearchResult {
            dimension: "cpu".into(),
            results: vec![contact("a")],
            counter: 1,
            last: false,
        };
        let mut serial_copy = serial.clone();
        serial_copy.results.push(contact("b"));
        serial_copy.results[0].addrs.clear();
        serial_copy.last = true;
        assert_eq!(serial.results.len(), 1);
        assert_eq!(serial.results[0].addrs.len(), 1);
        assert!(!serial.last);

        let parallel = ParallelSearchResult {
            results: BTreeMap::from([("cpu".to_string(), vec![contact("a")])]),
            visited: BTreeSet::from([Identity::derive(b"a")]),
            author: Identity::derive(b"a"),
        };
        let mut parallel_copy = parallel.clone();
        parallel_copy.results.get_mut("cpu").expect("cpu").push(contact("c"));
        parallel_copy.visited.insert(Identity::derive(b"z"));
        assert_eq!(parallel.results["cpu"].len(), 1);
        assert_eq!(parallel.visited.len(), 1);
    }

    #[test]
    fn update_copy_is_isolated_both_ways() {
        let mut original = UpdateRequest {
            adds: vec![Element::new("cpu", 1, contact("o"))],
            deletes: vec![Element::new("cpu", 2, contact("o"))],
            hop_count: 0,
            tracker: None,
        };
        let mut copy = original.clone();

        copy.record_hop();
        copy.adds[0].value = 10;
        copy.deletes.clear();
        assert_eq!(original.hop_count, 0);
        assert_eq!(original.adds[0].value, 1);
        assert_eq!(original.deletes.len(), 1);

        original.adds.push(Element::new("ram", 3, contact("o")));
        original.adds[0].owner.addrs.push("x:1".into());
        assert_eq!(copy.adds.len(), 1);
        assert_eq!(copy.adds[0].owner.addrs.len(), 1);
    }

    #[test]
    fn join_nack_copy_is_isolated() {
        let original = envelope(MessageBody::JoinNack { overlay_reachable: false });
        let mut copy = original.clone();
        copy.body = MessageBody::JoinNack { overlay_reachable: true };
        copy.receiver.addrs[0] = "changed:1".into();

        assert!(matches!(original.body, MessageBody::JoinNack { overlay_reachable: false }));
        assert_eq!(original.receiver.primary_addr(), Some("10.0.0.1:4000"));
    }

    #[test]
    fn reply_swaps_endpoints_and_keeps_operation() {
        let request = envelope(MessageBody::JoinRequest);
        let reply = request.reply(MessageBody::JoinAck);
        assert_eq!(reply.sender, request.receiver);
        assert_eq!(reply.receiver, request.sender);
        assert_eq!(reply.operation_id, request.operation_id);
    }

    #[test]
    fn range_query_bounds_are_inclusive() {
        let bounded = RangeQuery::new("cpu", 2, Some(4));
        assert!(!bounded.contains(1));
        assert!(bounded.contains(2));
        assert!(bounded.contains(4));
        assert!(!bounded.contains(5));

        let open = RangeQuery::at_least("cpu", 2);
        assert!(open.contains(i64::MAX));
        assert!(!open.contains(1));
    }

    #[test]
    fn unwired_elements_cannot_confirm() {
        let element = Element::new("cpu", 1, contact("o"));
        assert!(!element.is_wired());
        assert!(!element.confirm());
    }

    #[test]
    fn nack_classification() {
        assert!(MessageBody::Nack.is_nack());
        assert!(MessageBody::JoinNack { overlay_reachable: true }.is_nack());
        assert!(!MessageBody::Ack.is_nack());
        assert!(!MessageBody::JoinAck.is_nack());
    }
}
