//! Stream transfers over TCP
//!
//! The client sends the byte count as a newline-terminated decimal token; the
//! server answers with exactly that many bytes in fixed-size chunks and closes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::discover::Endpoint;
use crate::net;
use crate::protocol::{self, DEFAULT_CHUNK_SIZE, MAX_SIZE_TOKEN_LEN};
use crate::shutdown::cancelled;
use crate::stats::StatisticsRecord;

const RECV_BUFFER_SIZE: usize = 128 * 1024;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Bytes per write on the serving side
    pub chunk_size: usize,
    pub nodelay: bool,
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            nodelay: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

pub fn configure_stream(stream: &TcpStream, config: &TcpConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.nodelay)
}

/// What the serving side pushed for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSendStats {
    pub requested: u64,
    pub bytes_sent: u64,
    pub chunks: u64,
}

/// Read the size token, refusing lines longer than `MAX_SIZE_TOKEN_LEN`.
/// A token cut short by EOF is returned as-is.
async fn read_size_line<R>(reader: &mut R, buf: &mut String) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut total = 0;
    loop {
        let bytes = reader.fill_buf().await?;
        if bytes.is_empty() {
            return Ok(total);
        }

        if let Some(newline_pos) = bytes.iter().position(|&b| b == b'\n') {
            let to_read = newline_pos + 1;
            if total + to_read > MAX_SIZE_TOKEN_LEN {
                return Err(anyhow::anyhow!("Size token exceeds maximum length"));
            }
            buf.push_str(std::str::from_utf8(&bytes[..to_read])?);
            reader.consume(to_read);
            return Ok(total + to_read);
        }

        let len = bytes.len();
        if total + len > MAX_SIZE_TOKEN_LEN {
            return Err(anyhow::anyhow!("Size token exceeds maximum length"));
        }
        buf.push_str(std::str::from_utf8(bytes)?);
        reader.consume(len);
        total += len;
    }
}

/// Serve one accepted connection: read the requested size, write that many
/// bytes, close. A bad size token closes the connection without writing.
///
/// Every read and write races `cancel`, so a peer that never sends its token
/// or stops reading cannot hold the worker past shutdown.
pub async fn serve_stream(
    stream: TcpStream,
    peer: SocketAddr,
    config: &TcpConfig,
    mut cancel: watch::Receiver<bool>,
) -> anyhow::Result<StreamSendStats> {
    configure_stream(&stream, config)?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    tokio::select! {
        result = read_size_line(&mut reader, &mut line) => { result?; }
        _ = cancelled(&mut cancel) => {
            debug!("Stream request from {} cancelled before size token", peer);
            return Ok(StreamSendStats {
                requested: 0,
                bytes_sent: 0,
                chunks: 0,
            });
        }
    }
    let requested = protocol::parse_size_token(&line)?;
    debug!("Stream request from {}: {} bytes", peer, requested);

    let chunk = vec![0u8; config.chunk_size.max(1)];
    let mut stats = StreamSendStats {
        requested,
        bytes_sent: 0,
        chunks: 0,
    };

    while stats.bytes_sent < requested {
        let len = (requested - stats.bytes_sent).min(chunk.len() as u64) as usize;
        tokio::select! {
            result = writer.write_all(&chunk[..len]) => result?,
            _ = cancelled(&mut cancel) => {
                debug!(
                    "Stream send to {} cancelled after {} bytes",
                    peer, stats.bytes_sent
                );
                return Ok(stats);
            }
        }
        stats.bytes_sent += len as u64;
        stats.chunks += 1;
    }

    writer.shutdown().await?;
    debug!(
        "Stream to {} complete: {} bytes in {} chunks",
        peer, stats.bytes_sent, stats.chunks
    );
    Ok(stats)
}

/// Request `size` bytes over a fresh connection and time their arrival.
///
/// An early close by the server is not an error: the record carries the bytes
/// that did arrive and `complete == false`.
pub async fn request_stream_transfer(
    endpoint: &Endpoint,
    size: u64,
    config: &TcpConfig,
    mut cancel: watch::Receiver<bool>,
) -> anyhow::Result<StatisticsRecord> {
    let addr = endpoint.tcp_addr();
    let stream = net::connect_tcp(addr, config.connect_timeout).await?;
    configure_stream(&stream, config)?;
    let (mut reader, mut writer) = stream.into_split();

    let start = Instant::now();
    writer
        .write_all(protocol::encode_size_token(size).as_bytes())
        .await?;

    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    let mut received: u64 = 0;
    let mut complete = true;

    while received < size {
        let want = (size - received).min(buffer.len() as u64) as usize;
        tokio::select! {
            result = reader.read(&mut buffer[..want]) => {
                match result {
                    Ok(0) => {
                        debug!("Server {} closed after {} of {} bytes", addr, received, size);
                        complete = false;
                        break;
                    }
                    Ok(n) => {
                        received += n as u64;
                    }
                    Err(e) => {
                        warn!("Receive error from {}: {}", addr, e);
                        complete = false;
                        break;
                    }
                }
            }
            _ = cancelled(&mut cancel) => {
                debug!("Stream receive from {} cancelled", addr);
                complete = false;
                break;
            }
        }
    }

    let elapsed = start.elapsed();
    debug!(
        "Stream transfer from {} finished: {} bytes in {:?}",
        addr, received, elapsed
    );
    Ok(StatisticsRecord::stream(size, received, elapsed, complete))
}
