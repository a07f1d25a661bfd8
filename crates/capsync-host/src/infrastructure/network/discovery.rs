//! UDP service discovery.
//!
//! The host binds a UDP socket on the discovery port (default 9001) and
//! answers `{"type":"discover"}` datagrams with an announcement naming the
//! service and the TCP port devices should connect to:
//!
//! ```json
//! {"type":"announce","service":"capsync-host","port":9000,"protocol_version":1}
//! ```
//!
//! # How UDP discovery works (for beginners)
//!
//! A device that does not know the host's address broadcasts a small
//! `discover` datagram to the LAN.  Every machine on the segment receives
//! it; only the host answers, and it answers unicast to the sender's source
//! address.  The device reads the TCP port from the reply and connects.
//!
//! # Read timeout
//!
//! The responder runs on its own thread with blocking socket I/O.  The
//! socket has a 500 ms read timeout, so `recv_from` returns regularly and
//! the loop can notice that [`ServiceAdvertiser::unregister`] cleared the
//! `running` flag.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use capsync_core::protocol::messages::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("service is already being advertised")]
    AlreadyRegistered,

    #[error("failed to start discovery thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Advertises the host's listening port on the local network.
pub trait ServiceAdvertiser: Send {
    /// Starts advertising `service` on TCP `port`.
    fn register(&mut self, service: &str, port: u16) -> Result<(), DiscoveryError>;

    /// Stops advertising.  Does nothing if not registered.
    fn unregister(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DiscoveryDatagram {
    Discover,
    Announce {
        service: String,
        port: u16,
        protocol_version: u32,
    },
}

struct Responder {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// [`ServiceAdvertiser`] answering `discover` datagrams on a UDP port.
pub struct UdpDiscoveryAdvertiser {
    bind_addr: SocketAddr,
    responder: Option<Responder>,
}

impl UdpDiscoveryAdvertiser {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            responder: None,
        }
    }

    /// Address actually bound, once registered (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.responder.as_ref().map(|r| r.local_addr)
    }

    pub fn is_registered(&self) -> bool {
        self.responder.is_some()
    }
}

impl ServiceAdvertiser for UdpDiscoveryAdvertiser {
    fn register(&mut self, service: &str, port: u16) -> Result<(), DiscoveryError> {
        if self.responder.is_some() {
            return Err(DiscoveryError::AlreadyRegistered);
        }

        let addr = self.bind_addr;
        let socket = UdpSocket::bind(addr).map_err(|source| DiscoveryError::BindFailed { addr, source })?;
        if let Err(e) = socket.set_read_timeout(Some(READ_TIMEOUT)) {
            warn!("discovery socket read timeout not set: {e}");
        }
        let local_addr = socket.local_addr().unwrap_or(addr);

        let running = Arc::new(AtomicBool::new(true));
        let announce = DiscoveryDatagram::Announce {
            service: service.to_string(),
            port,
            protocol_version: PROTOCOL_VERSION,
        };
        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("capsync-discovery".to_string())
            .spawn(move || discovery_loop(socket, announce, flag))
            .map_err(DiscoveryError::Spawn)?;

        info!("advertising {service} (tcp port {port}) on udp {local_addr}");
        self.responder = Some(Responder {
            running,
            thread,
            local_addr,
        });
        Ok(())
    }

    fn unregister(&mut self) {
        let Some(responder) = self.responder.take() else {
            return;
        };
        responder.running.store(false, Ordering::Relaxed);
        if responder.thread.join().is_err() {
            warn!("discovery thread panicked");
        }
    }
}

impl Drop for UdpDiscoveryAdvertiser {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// The receive loop executed on the discovery thread.
fn discovery_loop(socket: UdpSocket, announce: DiscoveryDatagram, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 2048];
    let reply = match serde_json::to_vec(&announce) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to encode announce datagram: {e}");
            return;
        }
    };

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                warn!("discovery recv error: {e}");
                continue;
            }
        };

        match serde_json::from_slice::<DiscoveryDatagram>(&buf[..len]) {
            Ok(DiscoveryDatagram::Discover) => {
                debug!("discover from {src}");
                if let Err(e) = socket.send_to(&reply, src) {
                    warn!("failed to answer discover from {src}: {e}");
                }
            }
            Ok(DiscoveryDatagram::Announce { .. }) => {
                debug!("ignoring announce from {src}");
            }
            Err(e) => debug!("undecodable discovery datagram from {src}: {e}"),
        }
    }

    info!("discovery responder stopped");
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
