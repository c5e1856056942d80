//! UDP socket transport.
//!
//! One socket per endpoint. Sends happen on the caller's thread; a named
//! receive thread polls the socket with a short read timeout so it can
//! notice the stop signal.
//!
//! The receive thread holds only a [`WeakEndpoint`]: once the endpoint is
//! dropped the thread exits, and dropping the last transport handle joins it.
//! [`UdpTransport::stop`] stops it explicitly.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Sender, TryRecvError};
use tracing::{debug, trace, warn};

use super::DatagramTransport;
use crate::endpoint::{Endpoint, WeakEndpoint};
use crate::error::TransportError;

/// Largest datagram the receive loop accepts.
const RECV_BUF_LEN: usize = 65_536;
const READ_TIMEOUT: Duration = Duration::from_millis(50);

struct ReceiveWorker {
    stop_tx: Sender<()>,
    handle: thread::JoinHandle<()>,
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    worker: Mutex<Option<ReceiveWorker>>,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local = socket.local_addr()?;
        debug!(local = %local, "udp transport bound");
        Ok(Arc::new(UdpTransport {
            socket: Arc::new(socket),
            local,
            worker: Mutex::new(None),
        }))
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Spawn the receive thread feeding `endpoint`. No-op if already running.
    pub fn start(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let endpoint: WeakEndpoint = endpoint.downgrade();
        let socket = self.socket.clone();
        let local = self.local;
        let handle = thread::Builder::new()
            .name(format!("rudp-recv-{}", local.port()))
            .spawn(move || {
                let mut buf = vec![0u8; RECV_BUF_LEN];
                loop {
                    match stop_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }
                    match socket.recv_from(&mut buf) {
                        Ok((n, from)) => {
                            trace!(from = %from, len = n, "datagram received");
                            let Some(endpoint) = endpoint.upgrade() else {
                                break;
                            };
                            endpoint.handle_datagram(from, &buf[..n]);
                        }
                        Err(e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!(local = %local, error = %e, "udp receive failed");
                        }
                    }
                }
                debug!(local = %local, "udp receive thread exiting");
            })?;

        *worker = Some(ReceiveWorker { stop_tx, handle });
        Ok(())
    }

    /// Stop and join the receive thread. From the receive thread itself
    /// (last handle dropped while dispatching) it only signals.
    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            if worker.handle.thread().id() == thread::current().id() {
                return;
            }
            if worker.handle.join().is_err() {
                warn!(local = %self.local, "udp receive thread panicked");
            }
        }
    }
}

impl DatagramTransport for UdpTransport {
    fn send_to(&self, remote: SocketAddr, datagram: Bytes) {
        if let Err(e) = self.socket.send_to(&datagram, remote) {
            warn!(remote = %remote, error = %e, "udp send failed");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
