//! # In-Memory Network
//!
//! Deterministic stand-in for UDP in tests. Datagrams queue inside the
//! network until [`SimNetwork::deliver_all`] is called, so the handler that
//! sent a datagram never runs the receiver's handler on its own stack.
//!
//! Loss and reordering come from a seeded `StdRng`; a drop filter can target
//! specific datagrams (e.g. "lose the first HandshakeSynAck").

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use tracing::trace;

use super::DatagramTransport;
use crate::endpoint::Endpoint;

/// Upper bound on delivery rounds per `deliver_all` call.
const MAX_ROUNDS: usize = 256;

#[derive(Debug, Clone)]
pub struct SimDatagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: Bytes,
}

type DropFilter = Box<dyn FnMut(&SimDatagram) -> bool + Send>;

struct SimState {
    endpoints: HashMap<SocketAddr, Endpoint>,
    queue: VecDeque<SimDatagram>,
    rng: StdRng,
    loss: f64,
    reorder: f64,
    filter: Option<DropFilter>,
    delivered: u64,
    dropped: u64,
}

#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    pub fn new(seed: u64) -> Self {
        SimNetwork {
            state: Arc::new(Mutex::new(SimState {
                endpoints: HashMap::new(),
                queue: VecDeque::new(),
                rng: StdRng::seed_from_u64(seed),
                loss: 0.0,
                reorder: 0.0,
                filter: None,
                delivered: 0,
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Probability in `[0, 1]` that any datagram is dropped.
    pub fn set_loss(&self, loss: f64) {
        self.lock().loss = loss.clamp(0.0, 1.0);
    }

    /// Probability in `[0, 1]` that a datagram swaps places with another
    /// one in the same delivery round.
    pub fn set_reorder(&self, reorder: f64) {
        self.lock().reorder = reorder.clamp(0.0, 1.0);
    }

    /// Drop every datagram for which `filter` returns `true`.
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(&SimDatagram) -> bool + Send + 'static,
    {
        self.lock().filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.lock().filter = None;
    }

    /// Transport handle whose datagrams originate from `local`.
    pub fn transport(&self, local: SocketAddr) -> Arc<SimTransport> {
        Arc::new(SimTransport {
            local,
            network: self.clone(),
        })
    }

    /// Route datagrams addressed to `addr` into `endpoint`.
    pub fn attach(&self, addr: SocketAddr, endpoint: Endpoint) {
        self.lock().endpoints.insert(addr, endpoint);
    }

    pub fn detach(&self, addr: SocketAddr) {
        self.lock().endpoints.remove(&addr);
    }

    /// Enqueue a raw datagram, bypassing any endpoint.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, payload: Bytes) {
        self.lock().queue.push_back(SimDatagram { from, to, payload });
    }

    /// Remove and return everything queued without delivering it.
    pub fn drain(&self) -> Vec<SimDatagram> {
        self.lock().queue.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Deliver one round: everything queued right now, after loss and
    /// reordering. Datagrams sent while handling this round wait for the next.
    pub fn deliver_round(&self) -> usize {
        let batch: Vec<(Endpoint, SimDatagram)> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut batch: Vec<SimDatagram> = state.queue.drain(..).collect();

            if state.reorder > 0.0 && batch.len() > 1 {
                for i in 0..batch.len() {
                    if state.rng.random::<f64>() < state.reorder {
                        let j = state.rng.random_range(0..batch.len());
                        batch.swap(i, j);
                    }
                }
            }

            let mut routed = Vec::with_capacity(batch.len());
            for datagram in batch {
                let lost = state.loss > 0.0 && state.rng.random::<f64>() < state.loss;
                let filtered = match state.filter.as_mut() {
                    Some(filter) => filter(&datagram),
                    None => false,
                };
                if lost || filtered {
                    trace!(from = %datagram.from, to = %datagram.to, "sim datagram dropped");
                    state.dropped += 1;
                    continue;
                }
                match state.endpoints.get(&datagram.to) {
                    Some(endpoint) => routed.push((endpoint.clone(), datagram)),
                    None => state.dropped += 1,
                }
            }
            state.delivered += routed.len() as u64;
            routed
        };

        let count = batch.len();
        for (endpoint, datagram) in batch {
            endpoint.handle_datagram(datagram.from, &datagram.payload);
        }
        count
    }

    /// Deliver rounds until the network is quiet. Returns datagrams delivered.
    pub fn deliver_all(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_ROUNDS {
            if self.pending() == 0 {
                break;
            }
            total += self.deliver_round();
        }
        total
    }
}

/// One node's view of a [`SimNetwork`].
pub struct SimTransport {
    local: SocketAddr,
    network: SimNetwork,
}

impl DatagramTransport for SimTransport {
    fn send_to(&self, remote: SocketAddr, datagram: Bytes) {
        self.network.inject(self.local, remote, datagram);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn transport_enqueues_without_delivering() {
        let net = SimNetwork::new(1);
        let t = net.transport(addr(1));
        t.send_to(addr(2), Bytes::from_static(&[6]));
        assert_eq!(net.pending(), 1);

        let drained = net.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].from, addr(1));
        assert_eq!(drained[0].to, addr(2));
        assert_eq!(net.pending(), 0);
    }

    #[test]
    fn unrouted_datagrams_count_as_dropped() {
        let net = SimNetwork::new(1);
        net.inject(addr(1), addr(9), Bytes::from_static(&[7]));
        assert_eq!(net.deliver_all(), 0);
        assert_eq!(net.dropped(), 1);
    }

    #[test]
    fn full_loss_drops_everything() {
        let net = SimNetwork::new(7);
        net.set_loss(1.0);
        for _ in 0..10 {
            net.inject(addr(1), addr(2), Bytes::from_static(&[6]));
        }
        assert_eq!(net.deliver_all(), 0);
        assert_eq!(net.dropped(), 10);
    }

    #[test]
    fn drop_filter_sees_each_datagram() {
        let net = SimNetwork::new(3);
        net.set_drop_filter(|d| d.payload.first() == Some(&6));
        net.inject(addr(1), addr(2), Bytes::from_static(&[6]));
        net.inject(addr(1), addr(2), Bytes::from_static(&[7]));
        net.deliver_all();
        // Both dropped: one by the filter, one for lack of a route.
        assert_eq!(net.dropped(), 2);
    }
}
