//! Frame transport between replicas and clients.
//!
//! Runtimes only see [`Transport`]. [`InMemoryNetwork`] connects runtimes
//! in one process; every frame still goes through the wire codec, so a
//! message that would not survive encoding never reaches a peer.

use crate::metrics::Metrics;
use crate::queues::WorkQueues;
use crossbeam::channel::Sender;
use palisade_core::Event;
use palisade_messages::{decode_message, ClientResponse, Message};
use palisade_types::{ClientId, ReplicaId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Where outbound frames go.
pub trait Transport: Send + Sync {
    /// Deliver an encoded message from replica `from` to replica `to`.
    fn send_to_replica(&self, from: ReplicaId, to: ReplicaId, frame: Vec<u8>);

    /// Deliver an encoded response to a client.
    fn send_to_client(&self, from: ReplicaId, client: ClientId, frame: Vec<u8>);
}

#[derive(Default)]
struct Routes {
    replicas: HashMap<ReplicaId, Arc<WorkQueues>>,
    clients: HashMap<ClientId, Sender<ClientResponse>>,
    /// Directed links that drop everything.
    cut: HashSet<(ReplicaId, ReplicaId)>,
}

/// In-process network with partition injection.
pub struct InMemoryNetwork {
    routes: RwLock<Routes>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.routes.read();
        f.debug_struct("InMemoryNetwork")
            .field("replicas", &routes.replicas.len())
            .field("clients", &routes.clients.len())
            .field("cut_links", &routes.cut.len())
            .finish()
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Routes::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register_replica(&self, replica: ReplicaId, queues: Arc<WorkQueues>) {
        self.routes.write().replicas.insert(replica, queues);
    }

    pub fn register_client(&self, client: ClientId, responses: Sender<ClientResponse>) {
        self.routes.write().clients.insert(client, responses);
    }

    pub fn unregister_client(&self, client: ClientId) {
        self.routes.write().clients.remove(&client);
    }

    /// Cut every link between `side` and the rest of the replicas, both ways.
    pub fn partition(&self, side: &[ReplicaId]) {
        let mut routes = self.routes.write();
        let others: Vec<ReplicaId> = routes
            .replicas
            .keys()
            .copied()
            .filter(|r| !side.contains(r))
            .collect();
        for a in side {
            for b in &others {
                routes.cut.insert((*a, *b));
                routes.cut.insert((*b, *a));
            }
        }
        debug!(?side, "Network partitioned");
    }

    /// Drop frames from `from` to `to` only.
    pub fn cut_link(&self, from: ReplicaId, to: ReplicaId) {
        self.routes.write().cut.insert((from, to));
    }

    pub fn heal(&self) {
        self.routes.write().cut.clear();
        debug!("Network healed");
    }

    /// Client-side submission: decode and enqueue at `to`.
    pub fn submit(&self, to: ReplicaId, frame: &[u8]) {
        let routes = self.routes.read();
        self.deliver(&routes, to, frame);
    }

    fn dropped(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_frame_dropped(reason);
        }
    }

    fn deliver(&self, routes: &Routes, to: ReplicaId, frame: &[u8]) {
        let Some(queues) = routes.replicas.get(&to) else {
            self.dropped("unknown_peer");
            return;
        };
        match decode_message(frame) {
            Ok(message) => {
                trace!(to = to.0, message = message.type_name(), "Deliver");
                queues.push(Event::Message(message));
            }
            Err(error) => {
                warn!(to = to.0, ?error, "Dropping undecodable frame");
                self.dropped("decode");
            }
        }
    }
}

impl Transport for InMemoryNetwork {
    fn send_to_replica(&self, from: ReplicaId, to: ReplicaId, frame: Vec<u8>) {
        let routes = self.routes.read();
        if routes.cut.contains(&(from, to)) {
            trace!(from = from.0, to = to.0, "Partitioned link");
            self.dropped("partition");
            return;
        }
        self.deliver(&routes, to, &frame);
    }

    fn send_to_client(&self, _from: ReplicaId, client: ClientId, frame: Vec<u8>) {
        let routes = self.routes.read();
        let Some(responses) = routes.clients.get(&client) else {
            self.dropped("unknown_peer");
            return;
        };
        match decode_message(&frame) {
            Ok(Message::ClientResponse(response)) => {
                // A client that went away is not an error.
                let _ = responses.send(response);
            }
            Ok(other) => {
                warn!(client = client.0, message = other.type_name(), "Non-response frame for client");
                self.dropped("decode");
            }
            Err(error) => {
                warn!(client = client.0, ?error, "Dropping undecodable frame");
                self.dropped("decode");
            }
        }
    }
}
