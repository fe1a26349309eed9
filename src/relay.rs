//! Result relays.
//!
//! A responder that has matches for a search sends them straight back to the
//! requester as a single fire-and-forget message. Relays never wait for an
//! answer and cannot fail; losing the message only delays or starves the
//! requester's own search until its timeout.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::identity::{Contact, Identity};
use crate::messages::{Message, MessageBody, OperationId, ParallelSearchResult, SerialSearchResult};
use crate::operation::TrackerHandle;
use crate::protocols::{DeliveryId, Transport};

/// What a relay put on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayReceipt {
    pub delivery: DeliveryId,
    pub bytes: usize,
}

fn relay(
    transport: &dyn Transport,
    tracker: Option<&TrackerHandle>,
    message: Message,
) -> RelayReceipt {
    let bytes = message.size();
    trace!(
        op = message.operation_id,
        to = %message.receiver.identity,
        body = message.body.name(),
        bytes,
        "relaying result"
    );
    let delivery = transport.send(message, None);
    if let Some(tracker) = tracker {
        tracker.reply_sent();
    }
    RelayReceipt { delivery, bytes }
}

/// One numbered batch of matches for a single dimension.
#[derive(Clone, Debug)]
pub struct SerialResultRelay {
    pub requester: Contact,
    pub operation_id: OperationId,
    pub dimension: String,
    pub results: Vec<Contact>,
    /// 1-based batch number; on the last batch, the total count.
    pub counter: u32,
    pub last: bool,
}

impl SerialResultRelay {
    pub fn execute(
        self,
        local: Contact,
        transport: &dyn Transport,
        tracker: Option<&TrackerHandle>,
    ) -> RelayReceipt {
        let body = MessageBody::SerialResult(SerialSearchResult {
            dimension: self.dimension,
            results: self.results,
            counter: self.counter,
            last: self.last,
        });
        relay(
            transport,
            tracker,
            Message::new(local, self.requester, self.operation_id, body),
        )
    }
}

/// One visited peer's matches across every dimension. The author is always
/// the sending peer.
#[derive(Clone, Debug)]
pub struct ParallelResultRelay {
    pub requester: Contact,
    pub operation_id: OperationId,
    pub results: BTreeMap<String, Vec<Contact>>,
    pub visited: BTreeSet<Identity>,
}

impl ParallelResultRelay {
    pub fn execute(
        self,
        local: Contact,
        transport: &dyn Transport,
        tracker: Option<&TrackerHandle>,
    ) -> RelayReceipt {
        let body = MessageBody::ParallelResult(ParallelSearchResult {
            results: self.results,
            visited: self.visited,
            author: local.identity,
        });
        relay(
            transport,
            tracker,
            Message::new(local, self.requester, self.operation_id, body),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationEvent;
    use crate::testing::{contact, ScriptedNetwork};

    #[test]
    fn serial_relay_addresses_the_requester() {
        let network = ScriptedNetwork::new();
        let (tracker, mut rx) = TrackerHandle::detached();
        let requester = contact("requester");

        let receipt = SerialResultRelay {
            requester: requester.clone(),
            operation_id: 42,
            dimension: "x".into(),
            results: vec![contact("p1")],
            counter: 2,
            last: true,
        }
        .execute(contact("responder"), network.as_ref(), Some(&tracker));

        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].receiver, requester);
        assert_eq!(sent[0].operation_id, 42);
        assert_eq!(receipt.bytes, sent[0].size());
        match &sent[0].body {
            MessageBody::SerialResult(result) => {
                assert_eq!(result.counter, 2);
                assert!(result.last);
            }
            other => panic!("unexpected body {}", other.name()),
        }
        assert!(matches!(rx.try_recv(), Ok(OperationEvent::ReplySent)));
    }

    #[test]
    fn parallel_relay_is_authored_by_the_sender() {
        let network = ScriptedNetwork::new();
        let responder = contact("responder");

        ParallelResultRelay {
            requester: contact("requester"),
            operation_id: 7,
            results: BTreeMap::from([("x".to_string(), vec![contact("p")])]),
            visited: BTreeSet::from([responder.identity]),
        }
        .execute(responder.clone(), network.as_ref(), None);

        match &network.sent()[0].body {
            MessageBody::ParallelResult(result) => assert_eq!(result.author, responder.identity),
            other => panic!("unexpected body {}", other.name()),
        }
    }
}
