//! LAN discovery via UDP broadcast
//!
//! A server announces its transfer ports by broadcasting an Offer once per
//! interval. Clients bind the discovery port and take the first valid Offer
//! they hear; the sender's address becomes the server address.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::net;
use crate::protocol::{DISCOVERY_PORT, OFFER_LEN, Offer};
use crate::shutdown::cancelled;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// A server found on the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tcp {}, udp {})", self.ip, self.tcp_port, self.udp_port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no server offer received within {0:?}")]
    Timeout(Duration),
    #[error("discovery socket error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Where Offers are sent; normally the limited broadcast address
    pub target: SocketAddr,
    pub interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Bind a broadcast socket and spawn the announcer.
///
/// Socket errors are returned here; a send failure later ends the task and is
/// returned through its handle.
pub async fn start_broadcaster(
    config: BroadcastConfig,
    udp_port: u16,
    tcp_port: u16,
    cancel: watch::Receiver<bool>,
) -> io::Result<JoinHandle<io::Result<()>>> {
    let socket = net::create_broadcast_socket().await?;
    let offer = Offer { udp_port, tcp_port };
    info!(
        "Broadcasting offer (tcp {}, udp {}) to {} every {:?}",
        tcp_port, udp_port, config.target, config.interval
    );
    Ok(tokio::spawn(run_broadcaster(socket, config, offer, cancel)))
}

/// Send `offer` to the configured target every interval until cancelled.
pub async fn run_broadcaster(
    socket: UdpSocket,
    config: BroadcastConfig,
    offer: Offer,
    mut cancel: watch::Receiver<bool>,
) -> io::Result<()> {
    let packet = offer.encode();
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&packet, config.target).await {
                    error!("Offer broadcast to {} failed: {}", config.target, e);
                    return Err(e);
                }
                trace!("Offer sent to {}", config.target);
            }
            _ = cancelled(&mut cancel) => {
                debug!("Broadcaster stopped");
                return Ok(());
            }
        }
    }
}

/// Validate a received datagram as an Offer from `from`.
pub fn accept_offer(data: &[u8], from: SocketAddr) -> Option<Endpoint> {
    let offer = match Offer::decode(data) {
        Ok(offer) => offer,
        Err(e) => {
            trace!("Ignoring datagram from {}: {}", from, e);
            return None;
        }
    };
    if offer.udp_port == 0 || offer.tcp_port == 0 {
        trace!("Ignoring offer from {} advertising port 0", from);
        return None;
    }
    Some(Endpoint {
        ip: from.ip(),
        udp_port: offer.udp_port,
        tcp_port: offer.tcp_port,
    })
}

/// Wait on the standard discovery port for the first valid Offer.
pub async fn discover(timeout: Duration) -> Result<Endpoint, DiscoveryError> {
    discover_on(DISCOVERY_PORT, timeout).await
}

pub async fn discover_on(port: u16, timeout: Duration) -> Result<Endpoint, DiscoveryError> {
    let socket = net::create_discovery_socket(port).await?;
    debug!("Listening for offers on port {}", port);

    let listen = async {
        // Room for oversized junk so it is rejected on length, not truncated
        let mut buffer = [0u8; OFFER_LEN * 8];
        loop {
            let (n, from) = socket.recv_from(&mut buffer).await?;
            if let Some(endpoint) = accept_offer(&buffer[..n], from) {
                return Ok::<_, io::Error>(endpoint);
            }
        }
    };

    match tokio::time::timeout(timeout, listen).await {
        Ok(result) => {
            let endpoint = result?;
            info!("Discovered server at {}", endpoint);
            Ok(endpoint)
        }
        Err(_) => Err(DiscoveryError::Timeout(timeout)),
    }
}
