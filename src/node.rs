//! # High-Level Node API
//!
//! A [`Node`] is the application-facing handle of one peer. It starts
//! operations, routes asynchronous result messages to the operation they
//! belong to, and keeps track of which operations are still running.
//!
//! ## Quick Start
//!
//! ```ignore
//! let env = Environment::new(overlay, dht, transport).with_monitor(monitor);
//! let node = Node::new(env);
//!
//! node.join().await?;
//! node.update(vec![Element::new("cpu", 8, me.clone())], vec![]).await?;
//! let owners = node.search(vec![RangeQuery::new("cpu", 4, Some(16))], 0).await?;
//! ```
//!
//! ## Routing
//!
//! Every operation gets a locally unique [`OperationId`]. The transport hands
//! result messages addressed to this peer to [`Node::deliver`], which forwards
//! them to the matching operation. Once an operation completes, its id is
//! forgotten and later messages for it are rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::identity::Contact;
use crate::join::{JoinOperation, JoinOutcome};
use crate::messages::{Element, Message, OperationId, RangeQuery};
use crate::operation::{Environment, OperationError, OperationEvent, OperationLogic, OperationRunner};
use crate::search::SearchOperation;
use crate::update::{UpdateOperation, UpdateReceipt};

type Registry = Mutex<HashMap<OperationId, mpsc::UnboundedSender<OperationEvent>>>;

struct NodeInner {
    env: Environment,
    next_id: AtomicU64,
    registry: Registry,
}

impl NodeInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<OperationId, mpsc::UnboundedSender<OperationEvent>>> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Cheap to clone; all clones share the same operations.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(env: Environment) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                env,
                next_id: AtomicU64::new(1),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.env
    }

    pub fn contact(&self) -> Contact {
        self.inner.env.overlay.local_contact()
    }

    /// Find the owners of elements matching every query. With `k > 0` the
    /// search stops at the first `k` owners found.
    pub async fn search(&self, queries: Vec<RangeQuery>, k: usize) -> Result<Vec<Contact>, OperationError> {
        self.launch(SearchOperation::new(queries, k)).await
    }

    /// Announce `adds` and withdraw `deletes`, waiting for every element to
    /// be confirmed by the overlay.
    pub async fn update(&self, adds: Vec<Element>, deletes: Vec<Element>) -> Result<UpdateReceipt, OperationError> {
        self.launch(UpdateOperation::new(adds, deletes)).await
    }

    pub async fn join(&self) -> Result<JoinOutcome, OperationError> {
        self.launch(JoinOperation).await
    }

    /// Hand an inbound message to the operation it belongs to.
    ///
    /// Returns `false` if no running operation has that id.
    pub fn deliver(&self, message: Message) -> bool {
        let id = message.operation_id;
        let inbox = self.inner.registry().get(&id).cloned();
        match inbox {
            Some(inbox) => inbox.send(OperationEvent::Inbound(message)).is_ok(),
            None => {
                trace!(op = id, body = message.body.name(), "no running operation for message");
                false
            }
        }
    }

    /// Number of operations that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.inner.registry().len()
    }

    fn launch<L: OperationLogic>(
        &self,
        logic: L,
    ) -> impl std::future::Future<Output = Result<L::Output, OperationError>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let runner = OperationRunner::new(id, logic, self.inner.env.clone());
        self.inner.registry().insert(id, runner.inbox());

        let (done_tx, done_rx) = oneshot::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = runner.run().await;
            inner.registry().remove(&id);
            let _ = done_tx.send(outcome);
        });

        async move {
            match done_rx.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(op = id, "operation task dropped");
                    Err(OperationError::Aborted)
                }
            }
        }
    }
}
