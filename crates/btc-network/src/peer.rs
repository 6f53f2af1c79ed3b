//! Peer actor: owns one post-handshake connection.
//!
//! Three tasks cooperate per peer:
//!
//! - the **reader** decodes frames off the transport,
//! - the **dispatcher** handles decoded messages (answering pings locally
//!   and forwarding inv/block to the supervisor),
//! - the **writer** drains the outbound queue onto the transport.
//!
//! The queues between them are small and bounded; a saturated queue
//! stalls its producer. Termination is idempotent: the first quit wins,
//! fires the on-quit callback once, wakes any getaddr waiter, and stops
//! all three tasks through a watch channel.

use crate::block::{BlockPayload, Hash256};
use crate::codec::{encode_message, read_message, Message};
use crate::error::{NetworkError, NetworkResult};
use crate::message::{
    Address, AddrPayload, GetBlocksPayload, GetDataPayload, InvPayload, Inventory, InventoryType,
    NetworkAddress, Payload, PingPayload, PongPayload,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Capacity of the reader-to-dispatcher and outbound queues.
const QUEUE_CAPACITY: usize = 100;

/// Stable peer identifier: the remote address in canonical 16-byte form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    ip: [u8; 16],
    port: u16,
}

impl PeerId {
    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            ip,
            port: addr.port(),
        }
    }

    pub fn from_network_address(address: &NetworkAddress) -> Self {
        Self {
            ip: address.ip_octets(),
            port: address.port,
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Events a peer forwards to the supervisor.
#[derive(Debug)]
pub enum PeerEvent {
    /// The peer advertised inventory.
    Inv { from: PeerId, payload: InvPayload },
    /// The peer delivered a block.
    Block { from: PeerId, payload: BlockPayload },
}

/// Invoked exactly once when the peer terminates.
pub type OnQuit = Box<dyn Fn(PeerId) + Send + Sync>;

struct PeerIo {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    write_rx: mpsc::Receiver<Bytes>,
}

/// One live connection to a remote node.
pub struct Peer {
    id: PeerId,
    has_quit: Mutex<bool>,
    on_quit: OnQuit,
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,
    write_tx: mpsc::Sender<Bytes>,
    /// Single-flight slot for an in-flight getaddr request.
    addr_reply: Mutex<Option<oneshot::Sender<Vec<Address>>>>,
    events: mpsc::Sender<PeerEvent>,
    io: Mutex<Option<PeerIo>>,
}

impl Peer {
    /// Wrap a connection that already completed its handshake.
    pub fn new(
        stream: TcpStream,
        on_quit: OnQuit,
        events: mpsc::Sender<PeerEvent>,
    ) -> NetworkResult<Arc<Self>> {
        let id = PeerId::from_socket_addr(&stream.peer_addr()?);
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (quit_tx, quit_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            id,
            has_quit: Mutex::new(false),
            on_quit,
            quit_tx,
            quit_rx,
            write_tx,
            addr_reply: Mutex::new(None),
            events,
            io: Mutex::new(Some(PeerIo {
                read_half,
                write_half,
                write_rx,
            })),
        }))
    }

    /// Spawn the reader, dispatcher and writer tasks. No-op when called
    /// twice.
    pub fn start(self: &Arc<Self>) {
        let Some(io) = self.io.lock().take() else {
            return;
        };
        debug!(peer = %self.id, "starting peer");

        let (msg_tx, msg_rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(Arc::clone(self).read_loop(io.read_half, msg_tx));
        tokio::spawn(Arc::clone(self).dispatch_loop(msg_rx));
        tokio::spawn(Arc::clone(self).write_loop(io.write_half, io.write_rx));
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_quit(&self) -> bool {
        *self.has_quit.lock()
    }

    /// Terminate the peer. Idempotent; the on-quit callback fires once,
    /// any getaddr waiter is woken, and all three tasks stop.
    pub fn quit(&self) {
        {
            let mut has_quit = self.has_quit.lock();
            if *has_quit {
                return;
            }
            *has_quit = true;
        }
        debug!(peer = %self.id, "quitting peer");

        (self.on_quit)(self.id);
        // Dropping the pending sender wakes a supervisor waiting on the
        // reply with a "no reply" outcome.
        self.addr_reply.lock().take();
        let _ = self.quit_tx.send(true);
    }

    /// Send a getaddr and hand back the receiver for the reply.
    /// Only one request may be in flight at a time.
    pub async fn request_addresses(&self) -> NetworkResult<oneshot::Receiver<Vec<Address>>> {
        let receiver = {
            let mut slot = self.addr_reply.lock();
            if slot.is_some() {
                return Err(NetworkError::GetAddrInFlight);
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(tx);
            rx
        };

        if let Err(e) = self.send(&Payload::GetAddr).await {
            self.addr_reply.lock().take();
            return Err(e);
        }
        debug!(peer = %self.id, "sent getaddr");
        Ok(receiver)
    }

    /// Request full block data for the given hashes via getdata.
    pub async fn request_block_data(&self, hashes: Vec<Hash256>) -> NetworkResult<()> {
        let inventories = hashes
            .into_iter()
            .map(|hash| Inventory {
                kind: InventoryType::BLOCK,
                hash,
            })
            .collect();
        self.send(&Payload::GetData(GetDataPayload { inventories }))
            .await?;
        debug!(peer = %self.id, "sent getdata");
        Ok(())
    }

    /// Ask the peer for an inv of blocks following the locator.
    pub async fn request_blocks(
        &self,
        protocol_version: u32,
        locator_hashes: Vec<Hash256>,
        hash_stop: Hash256,
    ) -> NetworkResult<()> {
        self.send(&Payload::GetBlocks(GetBlocksPayload {
            version: protocol_version,
            locator_hashes,
            hash_stop,
        }))
        .await?;
        debug!(peer = %self.id, "sent getblocks");
        Ok(())
    }

    /// Enqueue an encoded message for the writer.
    async fn send(&self, payload: &Payload) -> NetworkResult<()> {
        if self.is_quit() {
            return Err(NetworkError::ConnectionClosed);
        }
        self.write_tx
            .send(encode_message(payload))
            .await
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, msg_tx: mpsc::Sender<Message>) {
        let mut quit_rx = self.quit_rx.clone();
        loop {
            let message = tokio::select! {
                biased;
                _ = quit_rx.changed() => break,
                result = read_message(&mut reader) => match result {
                    Ok(message) => message,
                    Err(e) if e.is_recoverable() => {
                        debug!(peer = %self.id, error = %e, "skipping message");
                        continue;
                    }
                    Err(NetworkError::ConnectionClosed) => {
                        debug!(peer = %self.id, "remote closed the connection");
                        self.quit();
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %self.id, error = %e, "read failed");
                        self.quit();
                        break;
                    }
                },
            };
            if msg_tx.send(message).await.is_err() {
                break;
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut msg_rx: mpsc::Receiver<Message>) {
        let mut quit_rx = self.quit_rx.clone();
        loop {
            let message = tokio::select! {
                biased;
                _ = quit_rx.changed() => break,
                maybe = msg_rx.recv() => match maybe {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(e) = self.dispatch(message.payload).await {
                warn!(peer = %self.id, error = %e, "dispatch failed");
                self.quit();
                break;
            }
        }
    }

    async fn dispatch(&self, payload: Payload) -> NetworkResult<()> {
        match payload {
            Payload::Ping(PingPayload { nonce }) => {
                self.send(&Payload::Pong(PongPayload { nonce })).await
            }
            Payload::Addr(payload) => {
                self.deliver_addresses(payload);
                Ok(())
            }
            Payload::Inv(payload) => {
                self.forward(PeerEvent::Inv {
                    from: self.id,
                    payload,
                })
                .await
            }
            Payload::Block(payload) => {
                self.forward(PeerEvent::Block {
                    from: self.id,
                    payload,
                })
                .await
            }
            // This node never serves data: everything else is ignored
            // after the handshake.
            _ => Ok(()),
        }
    }

    async fn forward(&self, event: PeerEvent) -> NetworkResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Hand an addr payload to the getaddr waiter, if any.
    fn deliver_addresses(&self, payload: AddrPayload) {
        let mut slot = self.addr_reply.lock();
        if slot.is_none() {
            return;
        }
        // A single entry naming the peer itself is an unsolicited
        // self-announcement, not a getaddr reply.
        if let [entry] = payload.addresses.as_slice() {
            if PeerId::from_network_address(&entry.address) == self.id {
                return;
            }
        }
        if let Some(sender) = slot.take() {
            debug!(peer = %self.id, count = payload.addresses.len(), "addr reply");
            let _ = sender.send(payload.addresses);
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut write_rx: mpsc::Receiver<Bytes>,
    ) {
        let mut quit_rx = self.quit_rx.clone();
        loop {
            let bytes = tokio::select! {
                biased;
                _ = quit_rx.changed() => break,
                maybe = write_rx.recv() => match maybe {
                    Some(bytes) => bytes,
                    None => break,
                },
            };
            if let Err(e) = writer.write_all(&bytes).await {
                warn!(peer = %self.id, error = %e, "write failed");
                self.quit();
                break;
            }
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("has_quit", &self.is_quit())
            .finish()
    }
}
