//! # Loopback Overlay
//!
//! An in-process overlay that plays every remote role an operation needs:
//! DHT, transport, entry points and responders. Each simulated peer gets its
//! own [`Node`] wired to a [`SimPeer`] adapter, so operations run unmodified
//! against it.
//!
//! The simulated skip graph is deliberately flat. Any online member accepts a
//! query, the traversal visits every online member starting at the entry
//! point, and each element lives on exactly one member chosen by hashing the
//! element. That is enough to exercise routing verdicts, both result
//! propagation modes, per-element confirmation and bootstrap failures.
//!
//! ## Faults
//!
//! | Fault | Effect |
//! |-------|--------|
//! | offline peer | messages to it time out after `delivery_timeout` |
//! | refusing peer | answers every request with a NACK |
//! | withholding peer | stores elements but never confirms them |
//! | bootstrap override | a slot resolves to nothing or to a foreign object |
//!
//! Every message put on the simulated wire is charged to
//! [`SimNetwork::bandwidth`] by body kind using [`Message::size`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::bootstrap::{BootstrapId, BootstrapResolver};
use crate::config::OperationConfig;
use crate::identity::{Contact, Identity};
use crate::join::JoinOutcome;
use crate::messages::{Element, Message, MessageBody, RangeQuery, SearchQuery, UpdateRequest};
use crate::node::Node;
use crate::operation::{Environment, OperationError};
use crate::protocols::{
    DeliveryId, DeliveryOutcome, DhtLookup, DhtObject, LocalOverlay, Monitor, ReplySink, Transport,
};
use crate::relay::{ParallelResultRelay, SerialResultRelay};

/// One-way latency of every simulated message.
pub const DEFAULT_SIM_LATENCY: Duration = Duration::from_millis(10);

/// How long a send to an unreachable peer takes to report a timeout.
pub const DEFAULT_SIM_DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

const DEFAULT_SIM_SEED: u64 = 0x5eed;

/// How responders return search results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Numbered per-dimension batches.
    #[default]
    Serial,
    /// One message per visited peer covering every dimension.
    Parallel,
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub latency: Duration,
    pub delivery_timeout: Duration,
    pub propagation: Propagation,
    /// Seeds every peer's bootstrap resolver.
    pub seed: u64,
    /// Applied to every peer's operations.
    pub operation: OperationConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency: DEFAULT_SIM_LATENCY,
            delivery_timeout: DEFAULT_SIM_DELIVERY_TIMEOUT,
            propagation: Propagation::default(),
            seed: DEFAULT_SIM_SEED,
            operation: OperationConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Bandwidth {
    pub messages: u64,
    pub bytes: u64,
}

struct PeerState {
    contact: Contact,
    node: Node,
    online: bool,
    member: bool,
    refusing: bool,
    withholding: bool,
    elements: Vec<Element>,
}

#[derive(Default)]
struct World {
    peers: HashMap<Identity, PeerState>,
    /// Join order; member `i` backs bootstrap slot `i`.
    members: Vec<Identity>,
    overrides: HashMap<BootstrapId, Option<DhtObject>>,
    bandwidth: BTreeMap<&'static str, Bandwidth>,
}

impl World {
    fn online_members(&self) -> Vec<Identity> {
        self.members
            .iter()
            .copied()
            .filter(|id| self.peers.get(id).is_some_and(|p| p.online))
            .collect()
    }
}

struct Shared {
    config: SimConfig,
    monitor: Option<Arc<dyn Monitor>>,
    next_delivery: AtomicU64,
    world: Mutex<World>,
}

impl Shared {
    fn world(&self) -> MutexGuard<'_, World> {
        match self.world.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn account(&self, message: &Message) {
        let mut world = self.world();
        let entry = world.bandwidth.entry(message.body.name()).or_default();
        entry.messages += 1;
        entry.bytes += message.size() as u64;
    }

    fn peer(self: &Arc<Self>, contact: Contact) -> SimPeer {
        SimPeer {
            shared: Arc::downgrade(self),
            contact,
        }
    }

    fn send(self: &Arc<Self>, message: Message, on_reply: Option<ReplySink>) -> DeliveryId {
        let delivery = self.next_delivery.fetch_add(1, Ordering::Relaxed);
        self.account(&message);
        let shared = Arc::downgrade(self);
        let latency = self.config.latency;
        tokio::spawn(async move {
            sleep(latency).await;
            if let Some(shared) = shared.upgrade() {
                shared.receive(message, on_reply, delivery).await;
            }
        });
        delivery
    }

    fn answer(&self, request: &Message, on_reply: Option<ReplySink>, delivery: DeliveryId, body: MessageBody) {
        let Some(sink) = on_reply else {
            return;
        };
        let reply = request.reply(body);
        self.account(&reply);
        let latency = self.config.latency;
        tokio::spawn(async move {
            sleep(latency).await;
            sink.deliver(delivery, DeliveryOutcome::Reply(reply));
        });
    }

    async fn receive(self: Arc<Self>, message: Message, on_reply: Option<ReplySink>, delivery: DeliveryId) {
        let receiver = {
            let world = self.world();
            world
                .peers
                .get(&message.receiver.identity)
                .filter(|p| p.online)
                .map(|p| (p.member, p.refusing, p.node.clone(), world.members.len()))
        };

        let Some((member, refusing, node, population)) = receiver else {
            trace!(to = %message.receiver.identity, body = message.body.name(), "receiver unreachable");
            if let Some(sink) = on_reply {
                sleep(self.config.delivery_timeout.saturating_sub(self.config.latency)).await;
                sink.deliver(delivery, DeliveryOutcome::TimedOut);
            }
            return;
        };

        match &message.body {
            MessageBody::Search(query) => {
                if !member || refusing {
                    self.answer(&message, on_reply, delivery, MessageBody::Nack);
                    return;
                }
                self.answer(&message, on_reply, delivery, MessageBody::Ack);
                self.respond_search(&message, query);
            }
            MessageBody::Update(update) => {
                if !member || refusing {
                    self.answer(&message, on_reply, delivery, MessageBody::Nack);
                    return;
                }
                self.answer(&message, on_reply, delivery, MessageBody::Ack);
                self.apply_update(&message, update);
            }
            MessageBody::JoinRequest => {
                let body = if refusing {
                    MessageBody::Nack
                } else if member {
                    MessageBody::JoinAck
                } else {
                    MessageBody::JoinNack {
                        overlay_reachable: population > 0,
                    }
                };
                self.answer(&message, on_reply, delivery, body);
            }
            MessageBody::SerialResult(_) | MessageBody::ParallelResult(_) => {
                if !node.deliver(message.clone()) {
                    trace!("result arrived after its search finished");
                }
            }
            other => trace!(body = other.name(), "dropping unsolicited message"),
        }
    }

    fn respond_search(self: &Arc<Self>, request: &Message, query: &SearchQuery) {
        let entry = request.receiver.identity;
        let visited: Vec<(Contact, Vec<Element>)> = {
            let world = self.world();
            let mut order = vec![entry];
            order.extend(world.online_members().into_iter().filter(|id| *id != entry));
            order
                .iter()
                .filter_map(|id| world.peers.get(id))
                .map(|p| (p.contact.clone(), p.elements.clone()))
                .collect()
        };

        let tracker = query.tracker.as_ref();
        for (peer, _) in &visited {
            if let Some(tracker) = tracker {
                tracker.hop(peer.identity);
            }
        }

        let mut dimensions: Vec<&str> = Vec::new();
        for q in &query.queries {
            if !dimensions.contains(&q.dimension.as_str()) {
                dimensions.push(&q.dimension);
            }
        }
        debug!(
            op = request.operation_id,
            visited = visited.len(),
            dimensions = dimensions.len(),
            mode = ?self.config.propagation,
            "answering search"
        );

        match self.config.propagation {
            Propagation::Serial => {
                for dimension in dimensions {
                    let mut batches: Vec<(Contact, Vec<Contact>)> = visited
                        .iter()
                        .map(|(peer, elements)| (peer.clone(), matches(elements, &query.queries, dimension)))
                        .filter(|(_, found)| !found.is_empty())
                        .collect();
                    if batches.is_empty() {
                        batches.push((request.receiver.clone(), Vec::new()));
                    }
                    let total = batches.len() as u32;
                    for (i, (responder, results)) in batches.into_iter().enumerate() {
                        let counter = i as u32 + 1;
                        SerialResultRelay {
                            requester: request.sender.clone(),
                            operation_id: request.operation_id,
                            dimension: dimension.to_string(),
                            results,
                            counter,
                            last: counter == total,
                        }
                        .execute(responder.clone(), &self.peer(responder), tracker);
                    }
                }
            }
            Propagation::Parallel => {
                let seen: BTreeSet<Identity> = visited.iter().map(|(peer, _)| peer.identity).collect();
                for (peer, elements) in &visited {
                    let results = dimensions
                        .iter()
                        .map(|d| (d.to_string(), matches(elements, &query.queries, d)))
                        .collect();
                    ParallelResultRelay {
                        requester: request.sender.clone(),
                        operation_id: request.operation_id,
                        results,
                        visited: seen.clone(),
                    }
                    .execute(peer.clone(), &self.peer(peer.clone()), tracker);
                }
            }
        }
    }

    fn apply_update(&self, request: &Message, update: &UpdateRequest) {
        let entry = request.receiver.identity;
        let mut update = update.clone();
        let tracker = update.tracker.clone();
        let mut confirmations = Vec::new();
        let mut hops = Vec::new();

        {
            let mut world = self.world();
            let members = world.online_members();
            if members.is_empty() {
                return;
            }

            for element in &update.adds {
                let target = members[placement(element, members.len())];
                hops.push((entry, false));
                if target != entry {
                    hops.push((target, false));
                }
                if let Some(peer) = world.peers.get_mut(&target) {
                    peer.elements.push(element.clone());
                    if !peer.withholding {
                        confirmations.push(element.clone());
                    }
                }
            }

            for element in &update.deletes {
                let target = members[placement(element, members.len())];
                hops.push((entry, true));
                if target != entry {
                    hops.push((target, true));
                }
                for peer in world.peers.values_mut() {
                    peer.elements.retain(|stored| stored != element);
                }
                if world.peers.get(&target).is_some_and(|p| !p.withholding) {
                    confirmations.push(element.clone());
                }
            }
        }

        for (peer, delete) in hops {
            update.record_hop();
            if let Some(tracker) = &tracker {
                if delete {
                    tracker.delete_hop(peer);
                } else {
                    tracker.hop(peer);
                }
            }
        }
        debug!(
            op = request.operation_id,
            adds = update.adds.len(),
            deletes = update.deletes.len(),
            hops = update.hop_count,
            confirmed = confirmations.len(),
            "applied update"
        );
        for element in confirmations {
            element.confirm();
        }
    }
}

/// Owners of elements in `dimension` that match any query on it, first match first.
fn matches(elements: &[Element], queries: &[RangeQuery], dimension: &str) -> Vec<Contact> {
    let mut found: Vec<Contact> = Vec::new();
    for element in elements.iter().filter(|e| e.dimension == dimension) {
        let hit = queries
            .iter()
            .any(|q| q.dimension == dimension && q.contains(element.value));
        if hit && !found.contains(&element.owner) {
            found.push(element.owner.clone());
        }
    }
    found
}

fn placement(element: &Element, members: usize) -> usize {
    let mut hasher = blake3::Hasher::new();
    hasher.update(element.dimension.as_bytes());
    hasher.update(&element.value.to_be_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_be_bytes(prefix) % members as u64) as usize
}

/// One simulated peer's view of the overlay, DHT and transport.
pub struct SimPeer {
    shared: Weak<Shared>,
    contact: Contact,
}

impl SimPeer {
    fn with_world<T>(&self, f: impl FnOnce(&World) -> T) -> Option<T> {
        let shared = self.shared.upgrade()?;
        let world = shared.world();
        Some(f(&world))
    }
}

impl LocalOverlay for SimPeer {
    fn local_contact(&self) -> Contact {
        self.contact.clone()
    }

    fn is_online(&self) -> bool {
        self.with_world(|w| w.peers.get(&self.contact.identity).is_some_and(|p| p.online))
            .unwrap_or(false)
    }

    fn local_entry_node(&self) -> Option<Contact> {
        self.with_world(|w| {
            w.peers
                .get(&self.contact.identity)
                .filter(|p| p.member)
                .map(|p| p.contact.clone())
        })
        .flatten()
    }

    fn population(&self) -> usize {
        self.with_world(|w| w.members.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DhtLookup for SimPeer {
    async fn lookup(&self, key: BootstrapId) -> Result<Option<DhtObject>> {
        let latency = match self.shared.upgrade() {
            Some(shared) => shared.config.latency,
            None => return Err(anyhow!("simulation has shut down")),
        };
        sleep(latency).await;
        self.with_world(|w| {
            if let Some(object) = w.overrides.get(&key) {
                return object.clone();
            }
            w.members
                .iter()
                .enumerate()
                .find(|(slot, _)| BootstrapId::for_index(*slot as u64) == key)
                .and_then(|(_, id)| w.peers.get(id))
                .map(|p| DhtObject::EntryPoint(p.contact.clone()))
        })
        .ok_or_else(|| anyhow!("simulation has shut down"))
    }
}

impl Transport for SimPeer {
    fn send(&self, message: Message, on_reply: Option<ReplySink>) -> DeliveryId {
        match self.shared.upgrade() {
            Some(shared) => shared.send(message, on_reply),
            None => {
                trace!("simulation has shut down, dropping message");
                0
            }
        }
    }
}

/// Owner of the simulated world. Dropping it stops all in-flight traffic.
pub struct SimNetwork {
    shared: Arc<Shared>,
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_monitor(config: SimConfig, monitor: Arc<dyn Monitor>) -> Self {
        Self::build(config, Some(monitor))
    }

    fn build(config: SimConfig, monitor: Option<Arc<dyn Monitor>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                monitor,
                next_delivery: AtomicU64::new(1),
                world: Mutex::new(World::default()),
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    /// Add an online, not yet joined peer. Adding an existing label returns
    /// the existing peer's node.
    pub fn add_peer(&self, label: &str) -> Node {
        let identity = Identity::derive(label.as_bytes());
        let mut world = self.shared.world();
        if let Some(existing) = world.peers.get(&identity) {
            return existing.node.clone();
        }

        let contact = Contact::single(identity, format!("sim://{label}"));
        let adapter = Arc::new(self.shared.peer(contact.clone()));
        let seed = self.shared.config.seed.wrapping_add(world.peers.len() as u64);
        let mut env = Environment::new(adapter.clone(), adapter.clone(), adapter)
            .with_resolver(Arc::new(BootstrapResolver::with_seed(seed)))
            .with_config(self.shared.config.operation.clone());
        if let Some(monitor) = &self.shared.monitor {
            env = env.with_monitor(monitor.clone());
        }
        let node = Node::new(env);

        world.peers.insert(
            identity,
            PeerState {
                contact,
                node: node.clone(),
                online: true,
                member: false,
                refusing: false,
                withholding: false,
                elements: Vec::new(),
            },
        );
        node
    }

    pub fn node(&self, identity: &Identity) -> Option<Node> {
        self.shared.world().peers.get(identity).map(|p| p.node.clone())
    }

    /// Run a join for `node` and, on success, make it an overlay member.
    pub async fn join(&self, node: &Node) -> Result<JoinOutcome, OperationError> {
        let outcome = node.join().await?;
        self.promote(&node.contact().identity);
        Ok(outcome)
    }

    /// Make a peer host a skip-graph node and back the next bootstrap slot.
    pub fn promote(&self, identity: &Identity) -> bool {
        let mut world = self.shared.world();
        let Some(peer) = world.peers.get_mut(identity) else {
            return false;
        };
        if !peer.member {
            peer.member = true;
            world.members.push(*identity);
            debug!(peer = %identity, population = world.members.len(), "peer joined overlay");
        }
        true
    }

    pub fn members(&self) -> Vec<Contact> {
        let world = self.shared.world();
        world
            .members
            .iter()
            .filter_map(|id| world.peers.get(id).map(|p| p.contact.clone()))
            .collect()
    }

    pub fn population(&self) -> usize {
        self.shared.world().members.len()
    }

    pub fn set_online(&self, identity: &Identity, online: bool) {
        if let Some(peer) = self.shared.world().peers.get_mut(identity) {
            peer.online = online;
        }
    }

    pub fn set_refusing(&self, identity: &Identity, refusing: bool) {
        if let Some(peer) = self.shared.world().peers.get_mut(identity) {
            peer.refusing = refusing;
        }
    }

    pub fn set_withholding(&self, identity: &Identity, withholding: bool) {
        if let Some(peer) = self.shared.world().peers.get_mut(identity) {
            peer.withholding = withholding;
        }
    }

    /// Make bootstrap slot `index` resolve to `object` instead of its member.
    pub fn override_bootstrap(&self, index: u64, object: Option<DhtObject>) {
        self.shared
            .world()
            .overrides
            .insert(BootstrapId::for_index(index), object);
    }

    pub fn clear_overrides(&self) {
        self.shared.world().overrides.clear();
    }

    pub fn stored_elements(&self, identity: &Identity) -> Vec<Element> {
        self.shared
            .world()
            .peers
            .get(identity)
            .map(|p| p.elements.clone())
            .unwrap_or_default()
    }

    pub fn bandwidth(&self) -> BTreeMap<&'static str, Bandwidth> {
        self.shared.world().bandwidth.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(label: &str) -> Contact {
        Contact::single(Identity::derive(label.as_bytes()), format!("sim://{label}"))
    }

    #[test]
    fn matches_dedupes_owners_and_respects_dimension() {
        let a = owner("a");
        let b = owner("b");
        let elements = vec![
            Element::new("x", 5, a.clone()),
            Element::new("x", 7, a.clone()),
            Element::new("y", 5, b.clone()),
            Element::new("x", 50, b.clone()),
        ];
        let queries = vec![RangeQuery::new("x", 0, Some(10)), RangeQuery::new("y", 0, None)];

        assert_eq!(matches(&elements, &queries, "x"), vec![a]);
        assert_eq!(matches(&elements, &queries, "y"), vec![b]);
        assert!(matches(&elements, &queries, "z").is_empty());
    }

    #[test]
    fn placement_is_stable_and_in_range() {
        let e = Element::new("x", 42, owner("a"));
        for members in 1..8 {
            let slot = placement(&e, members);
            assert!(slot < members);
            assert_eq!(slot, placement(&e, members));
        }
    }

    #[tokio::test]
    async fn peers_see_membership_and_bootstrap_slots() {
        let network = SimNetwork::new(SimConfig::default());
        let a = network.add_peer("a");
        let b = network.add_peer("b");
        let a_id = a.contact().identity;
        assert!(network.promote(&a_id));
        assert!(network.promote(&a_id));
        assert_eq!(network.population(), 1);

        let env = b.environment();
        assert!(env.overlay.is_online());
        assert_eq!(env.overlay.local_entry_node(), None);
        assert_eq!(a.environment().overlay.local_entry_node(), Some(a.contact()));

        let resolved = env.dht.lookup(BootstrapId::for_index(0)).await.expect("lookup");
        assert!(matches!(resolved, Some(DhtObject::EntryPoint(c)) if c == a.contact()));
        assert!(env.dht.lookup(BootstrapId::for_index(1)).await.expect("lookup").is_none());

        network.override_bootstrap(0, Some(DhtObject::Opaque(vec![0])));
        let poisoned = env.dht.lookup(BootstrapId::for_index(0)).await.expect("lookup");
        assert!(matches!(poisoned, Some(DhtObject::Opaque(_))));
    }

    #[tokio::test]
    async fn adding_a_peer_twice_returns_the_same_node() {
        let network = SimNetwork::new(SimConfig::default());
        let first = network.add_peer("same");
        let second = network.add_peer("same");
        assert_eq!(first.contact(), second.contact());
        assert!(network.node(&first.contact().identity).is_some());
    }
}
