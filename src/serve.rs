//! Server mode implementation
//!
//! Binds a stream listener and a datagram socket, announces both ports by
//! broadcast, and serves every request in its own task until cancelled.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::discover::{self, BroadcastConfig, Endpoint};
use crate::net;
use crate::protocol::{DEFAULT_CHUNK_SIZE, Offer, REQUEST_LEN, Request};
use crate::shutdown::cancelled;
use crate::tcp::{self, TcpConfig};
use crate::udp;

/// Back-off after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    /// 0 lets the OS pick
    pub tcp_port: u16,
    /// 0 lets the OS pick
    pub udp_port: u16,
    pub chunk_size: usize,
    pub nodelay: bool,
    /// None disables the Offer broadcaster
    pub broadcast: Option<BroadcastConfig>,
    /// Upper bound on concurrently running workers per transport
    pub max_workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 0,
            udp_port: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            nodelay: false,
            broadcast: Some(BroadcastConfig::default()),
            max_workers: None,
        }
    }
}

/// Independent transfer tasks. Finished tasks are reaped as new ones are
/// added; nothing waits on a worker until shutdown.
struct WorkerPool {
    tasks: JoinSet<()>,
    permits: Option<Arc<Semaphore>>,
}

impl WorkerPool {
    fn new(max_workers: Option<usize>) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: max_workers.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    fn spawn<F>(&mut self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }

        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            // Held for the lifetime of the worker
            let _permit = match permits {
                Some(permits) => match permits.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };
            worker.await;
        });
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    async fn join_all(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
    }
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    broadcast: Option<UdpSocket>,
    tcp_port: u16,
    udp_port: u16,
}

impl Server {
    /// Bind every socket the server needs. Nothing is spawned yet, so a bind
    /// failure leaves no stray tasks behind.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let listener =
            net::create_tcp_listener(SocketAddr::new(config.bind_ip, config.tcp_port)).await?;
        let udp = net::create_udp_socket(SocketAddr::new(config.bind_ip, config.udp_port)).await?;
        let broadcast = match config.broadcast {
            Some(_) => Some(net::create_broadcast_socket().await?),
            None => None,
        };

        let tcp_port = listener.local_addr()?.port();
        let udp_port = udp.local_addr()?.port();
        info!("Server ready: tcp {}, udp {}", tcp_port, udp_port);

        Ok(Self {
            config,
            listener,
            udp: Arc::new(udp),
            broadcast,
            tcp_port,
            udp_port,
        })
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    /// The endpoint a client on `ip` would discover
    pub fn endpoint(&self, ip: IpAddr) -> Endpoint {
        Endpoint {
            ip,
            udp_port: self.udp_port,
            tcp_port: self.tcp_port,
        }
    }

    /// Run the broadcaster, acceptor and datagram dispatcher until `cancel`
    /// fires, then wait for in-flight workers.
    pub async fn run(self, cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Server {
            config,
            listener,
            udp,
            broadcast,
            tcp_port,
            udp_port,
        } = self;

        let broadcaster = match (broadcast, config.broadcast.clone()) {
            (Some(socket), Some(broadcast_config)) => {
                let offer = Offer { udp_port, tcp_port };
                Some(tokio::spawn(discover::run_broadcaster(
                    socket,
                    broadcast_config,
                    offer,
                    cancel.clone(),
                )))
            }
            _ => None,
        };

        let tcp_config = TcpConfig {
            chunk_size: config.chunk_size,
            nodelay: config.nodelay,
            ..TcpConfig::default()
        };

        tokio::join!(
            accept_loop(listener, tcp_config, config.max_workers, cancel.clone()),
            dispatch_loop(udp, config.chunk_size, config.max_workers, cancel),
        );

        if let Some(handle) = broadcaster {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Broadcaster ended with error: {}", e),
                Err(e) => error!("Broadcaster task failed: {}", e),
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: TcpConfig,
    max_workers: Option<usize>,
    mut cancel: watch::Receiver<bool>,
) {
    let config = Arc::new(config);
    let mut pool = WorkerPool::new(max_workers);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                        continue;
                    }
                };
                debug!("Stream connection from {}", peer);

                let config = config.clone();
                let cancel = cancel.clone();
                pool.spawn(async move {
                    match tcp::serve_stream(stream, peer, &config, cancel).await {
                        Ok(stats) => debug!(
                            "Served {} of {} bytes to {}",
                            stats.bytes_sent, stats.requested, peer
                        ),
                        Err(e) => warn!("Stream worker for {} failed: {}", peer, e),
                    }
                });
            }
            _ = cancelled(&mut cancel) => break,
        }
    }

    debug!("Acceptor stopping, {} stream workers in flight", pool.len());
    pool.join_all().await;
}

async fn dispatch_loop(
    socket: Arc<UdpSocket>,
    chunk_size: usize,
    max_workers: Option<usize>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut pool = WorkerPool::new(max_workers);
    // Larger than a Request so oversized datagrams fail on length
    let mut buffer = [0u8; REQUEST_LEN * 4];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                let (n, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // e.g. ICMP port unreachable surfacing on some platforms
                        debug!("Datagram receive error: {}", e);
                        continue;
                    }
                };
                let request = match Request::decode(&buffer[..n]) {
                    Ok(request) => request,
                    Err(e) => {
                        trace!("Ignoring datagram from {}: {}", peer, e);
                        continue;
                    }
                };
                debug!("Datagram request from {}: {} bytes", peer, request.requested_size);

                let socket = socket.clone();
                let cancel = cancel.clone();
                pool.spawn(async move {
                    match udp::send_segments(socket, peer, request.requested_size, chunk_size, cancel).await {
                        Ok(stats) => debug!(
                            "Sent {} segments ({} bytes) to {}",
                            stats.segments_sent, stats.bytes_sent, peer
                        ),
                        Err(e) => warn!("Datagram worker for {} failed: {}", peer, e),
                    }
                });
            }
            _ = cancelled(&mut cancel) => break,
        }
    }

    debug!("Dispatcher stopping, {} datagram workers in flight", pool.len());
    pool.join_all().await;
}
