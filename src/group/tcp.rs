//! TCP group transport.
//!
//! The root rank listens and accepts one connection per peer; every other
//! rank connects to the root and announces its rank with a `Hello` frame.
//! Collectives only ever exchange frames between the root and a peer, so the
//! resulting star of connections is sufficient.
//!
//! ## Wire Format
//!
//! Each frame is a 4-byte little-endian length followed by the bincode
//! encoding of [`Frame`]. Frames larger than [`MAX_FRAME_SIZE`] are rejected
//! on both ends. Writes are bounded by [`WRITE_TIMEOUT`] so an unresponsive
//! peer surfaces as an error instead of blocking the sender forever.

use super::{CollectiveOp, Frame, GroupError, GroupTransport, Payload, ROOT_RANK};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Largest frame accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound for writing one frame.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection parameters shared by the root and its peers
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Socket send/receive buffer size
    pub buffer_size: usize,
    /// How long the root waits for all peers, and peers keep retrying
    pub connect_timeout: Duration,
    /// Pause between connection attempts
    pub retry_delay: Duration,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            buffer_size: crate::defaults::SOCKET_BUFFER_SIZE,
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            retry_delay: Duration::from_millis(crate::defaults::CONNECTION_RETRY_DELAY_MS),
        }
    }
}

/// Star-connected TCP transport for one rank
pub struct TcpTransport {
    rank: usize,
    size: usize,
    /// Root: one stream per peer. Peer: only `streams[ROOT_RANK]` is set.
    streams: Vec<Option<TcpStream>>,
}

impl TcpTransport {
    /// Bind the root's listening socket.
    pub async fn bind(addr: &str) -> Result<TcpListener, GroupError> {
        let listener = TcpListener::bind(addr).await?;
        debug!("Group root listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept `size - 1` peers on `listener` and return the root transport.
    pub async fn accept(
        listener: TcpListener,
        size: usize,
        options: &TcpOptions,
    ) -> Result<Self, GroupError> {
        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        let accept_all = async {
            let mut connected = 1;
            while connected < size {
                let (stream, peer_addr) = listener.accept().await?;
                let mut stream = configure_stream(stream, options.buffer_size)?;
                let hello = read_frame(&mut stream).await?;
                let peer = hello_rank(&hello, size)?;
                if streams[peer].is_some() {
                    warn!("Rank {} connected twice from {}, keeping the first", peer, peer_addr);
                    continue;
                }
                debug!("Rank {} joined from {}", peer, peer_addr);
                streams[peer] = Some(stream);
                connected += 1;
            }
            Ok::<(), GroupError>(())
        };

        let joined = timeout(options.connect_timeout, accept_all).await;
        match joined {
            Ok(result) => result?,
            Err(_) => {
                let missing: Vec<usize> = (1..size).filter(|r| streams[*r].is_none()).collect();
                return Err(GroupError::Timeout(format!(
                    "ranks {:?} did not join within {:?}",
                    missing, options.connect_timeout
                )));
            }
        }

        Ok(Self {
            rank: ROOT_RANK,
            size,
            streams,
        })
    }

    /// Listen on `addr` and accept the whole group.
    pub async fn listen(addr: &str, size: usize, options: &TcpOptions) -> Result<Self, GroupError> {
        let listener = Self::bind(addr).await?;
        Self::accept(listener, size, options).await
    }

    /// Connect a non-root rank to the root at `addr`, retrying until the
    /// connect timeout expires.
    pub async fn connect(
        addr: SocketAddr,
        rank: usize,
        size: usize,
        options: &TcpOptions,
    ) -> Result<Self, GroupError> {
        if rank == ROOT_RANK || rank >= size {
            return Err(GroupError::InvalidRank { rank, size });
        }

        let deadline = Instant::now() + options.connect_timeout;
        let mut attempts = 0u32;
        let stream = loop {
            attempts += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + options.retry_delay < deadline => {
                    debug!(
                        "Rank {} could not reach root at {} (attempt {}): {}",
                        rank, addr, attempts, e
                    );
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(e) => {
                    warn!(
                        "Rank {} giving up on root at {} after {} attempts",
                        rank, addr, attempts
                    );
                    return Err(e.into());
                }
            }
        };

        let mut stream = configure_stream(stream, options.buffer_size)?;
        let hello = Frame::new(CollectiveOp::Hello, 0, Payload::Words(vec![rank as i64]));
        write_frame(&mut stream, &hello).await?;
        debug!("Rank {} connected to root at {}", rank, addr);

        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        streams[ROOT_RANK] = Some(stream);
        Ok(Self {
            rank,
            size,
            streams,
        })
    }

    fn stream(&mut self, peer: usize) -> Result<&mut TcpStream, GroupError> {
        if peer >= self.size || peer == self.rank {
            return Err(GroupError::InvalidRank {
                rank: peer,
                size: self.size,
            });
        }
        self.streams[peer]
            .as_mut()
            .ok_or(GroupError::Disconnected(peer))
    }
}

#[async_trait]
impl GroupTransport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send(&mut self, peer: usize, frame: &Frame) -> Result<(), GroupError> {
        let stream = self.stream(peer)?;
        if let Err(e) = write_frame(stream, frame).await {
            self.streams[peer] = None;
            return Err(e);
        }
        Ok(())
    }

    async fn receive(&mut self, peer: usize) -> Result<Frame, GroupError> {
        let stream = self.stream(peer)?;
        match read_frame(stream).await {
            Ok(frame) => Ok(frame),
            Err(GroupError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.streams[peer] = None;
                Err(GroupError::Disconnected(peer))
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&mut self) -> Result<(), GroupError> {
        debug!("Closing TCP transport for rank {}", self.rank);
        for stream in self.streams.iter_mut() {
            if let Some(mut s) = stream.take() {
                let _ = s.shutdown().await;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

/// Apply low-latency socket options.
fn configure_stream(stream: TcpStream, buffer_size: usize) -> Result<TcpStream, GroupError> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    Ok(TcpStream::from_std(std_stream)?)
}

fn hello_rank(frame: &Frame, size: usize) -> Result<usize, GroupError> {
    match (&frame.op, &frame.payload) {
        (CollectiveOp::Hello, Payload::Words(words)) if words.len() == 1 => {
            let rank = usize::try_from(words[0]).map_err(|_| GroupError::InvalidRank {
                rank: usize::MAX,
                size,
            })?;
            if rank == ROOT_RANK || rank >= size {
                return Err(GroupError::InvalidRank { rank, size });
            }
            Ok(rank)
        }
        _ => Err(GroupError::Collective(format!(
            "expected a hello frame, got {:?}",
            frame.op
        ))),
    }
}

/// Read one length-prefixed frame.
async fn read_frame(stream: &mut TcpStream) -> Result<Frame, GroupError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_SIZE {
        return Err(GroupError::FrameTooLarge(frame_len));
    }

    let mut frame_data = vec![0u8; frame_len];
    stream.read_exact(&mut frame_data).await?;
    Frame::from_bytes(&frame_data)
}

/// Write one length-prefixed frame within [`WRITE_TIMEOUT`].
async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<(), GroupError> {
    let frame_bytes = frame.to_bytes()?;
    if frame_bytes.len() > MAX_FRAME_SIZE {
        return Err(GroupError::FrameTooLarge(frame_bytes.len()));
    }
    let frame_len = frame_bytes.len() as u32;

    let write_fut = async {
        stream.write_all(&frame_len.to_le_bytes()).await?;
        stream.write_all(&frame_bytes).await?;
        stream.flush().await?;
        Ok::<(), std::io::Error>(())
    };

    match timeout(WRITE_TIMEOUT, write_fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(GroupError::Timeout(format!(
            "writing a {} byte frame took longer than {:?}",
            frame_len, WRITE_TIMEOUT
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ProcessGroup;

    fn fast_options() -> TcpOptions {
        TcpOptions {
            buffer_size: 64 * 1024,
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_hello_rank_validation() {
        let ok = Frame::new(CollectiveOp::Hello, 0, Payload::Words(vec![2]));
        assert_eq!(hello_rank(&ok, 3).unwrap(), 2);

        let root = Frame::new(CollectiveOp::Hello, 0, Payload::Words(vec![0]));
        assert!(hello_rank(&root, 3).is_err());

        let wrong_op = Frame::new(CollectiveOp::Barrier, 0, Payload::Words(vec![1]));
        assert!(hello_rank(&wrong_op, 3).is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_root_rank() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            TcpTransport::connect(addr, 0, 3, &fast_options()).await,
            Err(GroupError::InvalidRank { .. })
        ));
    }

    /// Collectives behave the same over loopback TCP as in-process
    #[tokio::test]
    async fn test_collectives_over_loopback() {
        let size = 3;
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let options = fast_options();

        let root_options = options.clone();
        let root = tokio::spawn(async move {
            let transport = TcpTransport::accept(listener, size, &root_options).await.unwrap();
            let mut group = ProcessGroup::new(Box::new(transport), "loopback");
            group.barrier().await.unwrap();
            let sum = group.reduce_sum(1, 0).await.unwrap();
            let gathered = group.gather(&[0, 0], 0).await.unwrap();
            (sum, gathered)
        });

        let mut peers = Vec::new();
        for rank in 1..size {
            let options = options.clone();
            peers.push(tokio::spawn(async move {
                let transport = TcpTransport::connect(addr, rank, size, &options).await.unwrap();
                let mut group = ProcessGroup::new(Box::new(transport), "loopback");
                group.barrier().await.unwrap();
                group.reduce_sum(rank as i64 + 1, 0).await.unwrap();
                group.gather(&[rank as i64, -(rank as i64)], 0).await.unwrap()
            }));
        }

        for peer in peers {
            assert_eq!(peer.await.unwrap(), None);
        }
        let (sum, gathered) = root.await.unwrap();
        assert_eq!(sum, 6);
        assert_eq!(gathered, Some(vec![0, 0, 1, -1, 2, -2]));
    }
}
