//! # Endpoint
//!
//! Owns every [`Connection`] bound to one local transport, keyed by remote
//! address. Inbound datagrams are decoded here and routed to their
//! connection; a `HandshakeSyn` from an unknown peer creates a passive
//! connection. At most one connection exists per remote address at a time.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use quanta::Clock;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::connection::{Connection, Role};
use crate::error::TransportError;
use crate::net::DatagramTransport;
use crate::scheduler::Scheduler;
use crate::wire::Message;

type AcceptFn = Arc<Mutex<dyn FnMut(Arc<Connection>) + Send>>;

pub(crate) struct EndpointShared {
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) transport: Arc<dyn DatagramTransport>,
    pub(crate) scheduler: Scheduler,
    pub(crate) clock: Clock,
    connections: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    accept_handlers: Mutex<Vec<AcceptFn>>,
}

impl EndpointShared {
    fn connections(&self) -> MutexGuard<'_, HashMap<SocketAddr, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget `conn` if it is still the connection registered for `remote`.
    pub(crate) fn remove(&self, remote: SocketAddr, conn: &Connection) {
        let mut connections = self.connections();
        let registered = connections
            .get(&remote)
            .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), conn));
        if registered {
            connections.remove(&remote);
        }
    }

    /// Hand a newly established passive connection to the accept handlers.
    pub(crate) fn announce_accepted(&self, conn: Arc<Connection>) {
        let handlers: Vec<AcceptFn> = self
            .accept_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if handlers.is_empty() {
            return;
        }
        self.scheduler.post(move || {
            for handler in handlers {
                let mut f = handler.lock().unwrap_or_else(|e| e.into_inner());
                (*f)(conn.clone());
            }
        });
    }
}

/// Non-owning [`Endpoint`] handle, held by transports that feed it.
#[derive(Clone)]
pub struct WeakEndpoint {
    shared: Weak<EndpointShared>,
}

impl WeakEndpoint {
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.shared.upgrade().map(|shared| Endpoint { shared })
    }
}

/// Cloneable handle; clones share the same connection table.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    /// Fails with [`TransportError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        scheduler: Scheduler,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        Self::with_clock(transport, scheduler, config, Clock::new())
    }

    /// Same as [`Endpoint::new`] with an explicit clock, e.g. `Clock::mock()`.
    pub fn with_clock(
        transport: Arc<dyn DatagramTransport>,
        scheduler: Scheduler,
        config: TransportConfig,
        clock: Clock,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Endpoint {
            shared: Arc::new(EndpointShared {
                config: Arc::new(config),
                transport,
                scheduler,
                clock,
                connections: Mutex::new(HashMap::new()),
                accept_handlers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Handle that does not keep the endpoint (or its transport) alive.
    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.local_addr()
    }

    /// Open a connection to `remote`. If one already exists it is returned
    /// unchanged. Success is signalled by the connection's `on_connect`.
    pub fn connect(&self, remote: SocketAddr) -> Arc<Connection> {
        let conn = {
            let mut connections = self.shared.connections();
            if let Some(existing) = connections.get(&remote) {
                return existing.clone();
            }
            let conn = Connection::new(remote, Role::Active, &self.shared);
            connections.insert(remote, conn.clone());
            conn
        };
        conn.open();
        conn
    }

    /// Resolve `addr` and connect to the first address it yields.
    pub fn connect_host<A: ToSocketAddrs>(&self, addr: A) -> Result<Arc<Connection>, TransportError> {
        let remote = addr
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(e.to_string()))?
            .next()
            .ok_or_else(|| TransportError::Resolve("no addresses found".into()))?;
        Ok(self.connect(remote))
    }

    /// Register a callback for passive connections once they are Established.
    pub fn on_accept<F>(&self, handler: F)
    where
        F: FnMut(Arc<Connection>) + Send + 'static,
    {
        self.shared
            .accept_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(Mutex::new(handler)));
    }

    pub fn connection(&self, remote: SocketAddr) -> Option<Arc<Connection>> {
        self.shared.connections().get(&remote).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections().len()
    }

    /// Entry point for every inbound datagram.
    pub fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let existing = self.shared.connections().get(&from).cloned();

        let Some(msg) = Message::decode(datagram) else {
            trace!(from = %from, len = datagram.len(), "invalid datagram dropped");
            if let Some(conn) = existing {
                conn.record_invalid();
            }
            return;
        };

        if let Some(conn) = existing {
            conn.handle_message(msg);
            return;
        }

        let Message::HandshakeSyn { seq } = msg else {
            trace!(from = %from, kind = ?msg.message_type(), "datagram without connection dropped");
            return;
        };

        let conn = {
            let mut connections = self.shared.connections();
            if let Some(raced) = connections.get(&from) {
                let raced = raced.clone();
                drop(connections);
                raced.handle_message(msg);
                return;
            }
            let conn = Connection::new(from, Role::Passive, &self.shared);
            connections.insert(from, conn.clone());
            conn
        };
        debug!(from = %from, seq, "inbound handshake");
        conn.accept(seq);
    }

    /// Abortively close every connection.
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = self.shared.connections().values().cloned().collect();
        for conn in connections {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::sim::SimNetwork;

    fn local() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 1))
    }

    #[test]
    fn construction_validates_config() {
        let net = SimNetwork::new(1);
        let oversized = TransportConfig::default().with_packet_size(70_000);
        let err = Endpoint::new(net.transport(local()), Scheduler::new(), oversized).err();
        assert!(matches!(err, Some(TransportError::InvalidConfig(_))));

        let zero_window = TransportConfig::default().with_window_size(0);
        assert!(Endpoint::new(net.transport(local()), Scheduler::new(), zero_window).is_err());

        assert!(Endpoint::new(net.transport(local()), Scheduler::new(), TransportConfig::default()).is_ok());
    }

    #[test]
    fn weak_handle_does_not_keep_endpoint_alive() {
        let net = SimNetwork::new(2);
        let endpoint = Endpoint::new(net.transport(local()), Scheduler::new(), TransportConfig::default()).unwrap();
        let weak = endpoint.downgrade();
        assert!(weak.upgrade().is_some());

        drop(endpoint);
        assert!(weak.upgrade().is_none());
    }
}
