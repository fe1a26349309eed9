//! Scripted collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::bootstrap::BootstrapId;
use crate::identity::{Contact, Identity};
use crate::messages::{Message, MessageBody};
use crate::protocols::{
    DeliveryId, DeliveryOutcome, DhtLookup, DhtObject, LocalOverlay, ReplySink, Transport,
};

pub(crate) fn contact(label: &str) -> Contact {
    Contact::single(Identity::derive(label.as_bytes()), format!("10.0.0.1:{}", label.len() + 4000))
}

type Responder = Box<dyn Fn(&Message) -> Option<DeliveryOutcome> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One object standing in for the overlay, the DHT and the transport.
///
/// Every send is recorded; with a reply handler attached, the responder's
/// verdict (ACK by default) is delivered synchronously.
pub(crate) struct ScriptedNetwork {
    local: Contact,
    online: AtomicBool,
    entry: Mutex<Option<Contact>>,
    population: AtomicUsize,
    dht: Mutex<HashMap<BootstrapId, DhtObject>>,
    lookups: Mutex<Vec<BootstrapId>>,
    sent: Mutex<Vec<(DeliveryId, Message)>>,
    sinks: Mutex<HashMap<DeliveryId, ReplySink>>,
    responder: Mutex<Responder>,
    next_delivery: AtomicU64,
    send_count: watch::Sender<usize>,
}

impl ScriptedNetwork {
    pub(crate) fn new() -> Arc<Self> {
        let (send_count, _) = watch::channel(0);
        Arc::new(Self {
            local: contact("local"),
            online: AtomicBool::new(true),
            entry: Mutex::new(None),
            population: AtomicUsize::new(0),
            dht: Mutex::new(HashMap::new()),
            lookups: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            sinks: Mutex::new(HashMap::new()),
            responder: Mutex::new(Box::new(|message: &Message| {
                Some(DeliveryOutcome::Reply(message.reply(MessageBody::Ack)))
            })),
            next_delivery: AtomicU64::new(1),
            send_count,
        })
    }

    pub(crate) fn local(&self) -> Contact {
        self.local.clone()
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn set_local_entry(&self, entry: Option<Contact>) {
        *lock(&self.entry) = entry;
    }

    pub(crate) fn set_population(&self, population: usize) {
        self.population.store(population, Ordering::SeqCst);
    }

    pub(crate) fn set_dht(&self, key: BootstrapId, object: Option<DhtObject>) {
        let mut dht = lock(&self.dht);
        match object {
            Some(object) => {
                dht.insert(key, object);
            }
            None => {
                dht.remove(&key);
            }
        }
    }

    pub(crate) fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Message) -> Option<DeliveryOutcome> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Box::new(responder);
    }

    pub(crate) fn lookups(&self) -> Vec<BootstrapId> {
        lock(&self.lookups).clone()
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        lock(&self.sent).iter().map(|(_, m)| m.clone()).collect()
    }

    pub(crate) fn sent_with_ids(&self) -> Vec<(DeliveryId, Message)> {
        lock(&self.sent).clone()
    }

    /// Report a late outcome for an earlier delivery.
    pub(crate) fn complete(&self, delivery: DeliveryId, outcome: DeliveryOutcome) -> bool {
        match lock(&self.sinks).get(&delivery) {
            Some(sink) => sink.deliver(delivery, outcome),
            None => false,
        }
    }

    pub(crate) async fn wait_for_sends(&self, count: usize) {
        let mut rx = self.send_count.subscribe();
        let _ = rx.wait_for(|sent| *sent >= count).await;
    }
}

impl LocalOverlay for ScriptedNetwork {
    fn local_contact(&self) -> Contact {
        self.local.clone()
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn local_entry_node(&self) -> Option<Contact> {
        lock(&self.entry).clone()
    }

    fn population(&self) -> usize {
        self.population.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DhtLookup for ScriptedNetwork {
    async fn lookup(&self, key: BootstrapId) -> Result<Option<DhtObject>> {
        lock(&self.lookups).push(key);
        Ok(lock(&self.dht).get(&key).cloned())
    }
}

impl Transport for ScriptedNetwork {
    fn send(&self, message: Message, on_reply: Option<ReplySink>) -> DeliveryId {
        let delivery = self.next_delivery.fetch_add(1, Ordering::SeqCst);
        let verdict = match on_reply {
            Some(_) => {
                let responder = lock(&self.responder);
                (*responder)(&message)
            }
            None => None,
        };
        let count = {
            let mut sent = lock(&self.sent);
            sent.push((delivery, message));
            sent.len()
        };
        if let Some(sink) = on_reply {
            if let Some(outcome) = verdict {
                sink.deliver(delivery, outcome);
            }
            lock(&self.sinks).insert(delivery, sink);
        }
        self.send_count.send_replace(count);
        delivery
    }
}
