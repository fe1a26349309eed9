//! Boundary traits between the operation core and its collaborators.
//!
//! The skip-graph node, the DHT, the message transport and the statistics
//! monitor all live outside this crate's protocol core. Operations only see
//! them through the traits below, so the same operations run against the
//! loopback overlay in [`crate::sim`] and against scripted test doubles.
//!
//! | Collaborator | Trait | Used for |
//! |--------------|-------|----------|
//! | local skip-graph node | [`LocalOverlay`] | presence check, local-first entry |
//! | DHT | [`DhtLookup`] | bootstrap key → entry point |
//! | transport | [`Transport`] | dispatch with reply/timeout routing |
//! | monitor | [`Monitor`] | per-operation statistics |

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bootstrap::BootstrapId;
use crate::identity::Contact;
use crate::messages::Message;
use crate::monitor::OperationReport;
use crate::operation::OperationEvent;

/// Transport-assigned identifier of one dispatched message.
pub type DeliveryId = u64;

/// What the local peer knows about its own overlay membership.
pub trait LocalOverlay: Send + Sync + 'static {
    /// Contact used as the sender of outbound messages.
    fn local_contact(&self) -> Contact;

    /// Whether this peer is currently present in the overlay network.
    fn is_online(&self) -> bool;

    /// The skip-graph node hosted by this peer, if any.
    fn local_entry_node(&self) -> Option<Contact>;

    /// Current number of overlay nodes; sizes the bootstrap pool.
    fn population(&self) -> usize;
}

/// Values the DHT may hold under a bootstrap key.
#[derive(Clone, Debug)]
pub enum DhtObject {
    /// An entry point descriptor naming a reachable overlay node.
    EntryPoint(Contact),
    /// Anything else stored under the key.
    Opaque(Vec<u8>),
}

#[async_trait]
pub trait DhtLookup: Send + Sync + 'static {
    async fn lookup(&self, key: BootstrapId) -> Result<Option<DhtObject>>;
}

/// How a single dispatched message ended.
#[derive(Clone, Debug)]
pub enum DeliveryOutcome {
    Reply(Message),
    TimedOut,
}

/// Where a transport reports the fate of a message sent with a reply handler.
#[derive(Clone, Debug)]
pub struct ReplySink {
    tx: mpsc::UnboundedSender<OperationEvent>,
}

impl ReplySink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<OperationEvent>) -> Self {
        Self { tx }
    }

    /// Returns `false` once the issuing operation has finished.
    pub fn deliver(&self, delivery: DeliveryId, outcome: DeliveryOutcome) -> bool {
        self.tx
            .send(OperationEvent::Delivery { delivery, outcome })
            .is_ok()
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Dispatch `message`. With `on_reply`, the transport later reports
    /// either the receiver's reply or a delivery timeout tagged with the
    /// returned id; without it the send is fire-and-forget.
    fn send(&self, message: Message, on_reply: Option<ReplySink>) -> DeliveryId;
}

/// Best-effort sink for completed-operation statistics.
pub trait Monitor: Send + Sync + 'static {
    fn operation_completed(&self, report: OperationReport);
}
