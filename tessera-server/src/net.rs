//! TCP realisation of the core's frame transport.
//!
//! Frames are written back to back: the fixed header first, then
//! `header.size` payload bytes. One writer task per connection keeps the
//! per-connection FIFO the core relies on; inbound frames land in the
//! node's inbox tagged with the address replies should go back to.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tessera_core::transport::FrameTransport;
use tessera_core::wire::FRAME_HEADER_LEN;
use tessera_core::{Frame, FrameHeader, NodeAddr, Result, StoreError};

type WriterMap = Arc<Mutex<HashMap<NodeAddr, mpsc::UnboundedSender<Frame>>>>;

pub struct TcpMesh {
    inbox_tx: mpsc::UnboundedSender<(NodeAddr, Frame)>,
    writers: WriterMap,
}

impl TcpMesh {
    pub fn new() -> (Arc<TcpMesh>, mpsc::UnboundedReceiver<(NodeAddr, Frame)>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mesh = Arc::new(TcpMesh {
            inbox_tx,
            writers: Arc::new(Mutex::new(HashMap::new())),
        });
        (mesh, inbox_rx)
    }

    /// Bind and start accepting peer connections; returns the bound
    /// address (useful with port 0).
    pub async fn listen(self: &Arc<Self>, bind: &str) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;

        let mesh = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!("accepted connection from {}", peer);
                        mesh.adopt(NodeAddr::from(peer.to_string()), stream);
                    }
                    Err(error) => {
                        tracing::warn!("accept failed: {}", error);
                    }
                }
            }
        });

        tracing::info!("listening on {}", local);
        Ok(local)
    }

    /// Take ownership of a connection: a writer task draining the send
    /// queue and a reader task feeding the inbox.
    fn adopt(&self, peer: NodeAddr, stream: TcpStream) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        self.writers.lock().insert(peer.clone(), tx);

        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(error) = write_half.write_all(&frame.encode()).await {
                    tracing::debug!("write to {} failed: {}", writer_peer, error);
                    break;
                }
            }
        });

        let writers = Arc::clone(&self.writers);
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if inbox.send((peer.clone(), frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::debug!("read from {} failed: {}", peer, error);
                        break;
                    }
                }
            }
            writers.lock().remove(&peer);
            tracing::debug!("connection to {} closed", peer);
        });
    }

    /// Existing connection, or dial the peer on demand.
    async fn writer_for(&self, addr: &NodeAddr) -> Result<mpsc::UnboundedSender<Frame>> {
        if let Some(tx) = self.writers.lock().get(addr) {
            return Ok(tx.clone());
        }

        let stream = TcpStream::connect(addr.as_str()).await.map_err(|error| {
            tracing::debug!("connect to {} failed: {}", addr, error);
            StoreError::NoRoute
        })?;
        stream.set_nodelay(true)?;
        self.adopt(addr.clone(), stream);

        self.writers
            .lock()
            .get(addr)
            .cloned()
            .ok_or(StoreError::NoRoute)
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<Frame>> {
    let mut header_raw = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header_raw).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error),
    }

    let header = FrameHeader::decode(&mut &header_raw[..])
        .map_err(|error| std::io::Error::other(error.to_string()))?;

    let mut payload = vec![0u8; header.size as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame { header, payload: Bytes::from(payload) }))
}

#[async_trait::async_trait]
impl FrameTransport for TcpMesh {
    /// The connection itself identifies the sender; `from` only matters
    /// on the loopback mesh.
    async fn send(&self, _from: &NodeAddr, to: &NodeAddr, frame: Frame) -> Result<()> {
        let tx = self.writer_for(to).await?;
        tx.send(frame).map_err(|_| StoreError::NoRoute)
    }
}
