//! The node supervisor.
//!
//! A single serialized event loop reacts to the quit signal, a periodic
//! sync tick, the ensure-minimum-peers signal, and inv/block events
//! forwarded by peers. Everything the loop shares with dial workers and
//! peer callbacks (the peer map, the address sets, the block set) lives
//! in [`NodeState`] behind short reader-writer critical sections.

use crate::config::NodeConfig;
use btc_network::{
    perform_handshake, BlockPayload, Hash256, InvPayload, NetworkResult, Peer, PeerEvent, PeerId,
    Services, GENESIS_BLOCK_HASH,
};
use btc_store::{BlockStore, StoreResult};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Capacity of the peer-event channel feeding the supervisor loop.
const EVENT_QUEUE: usize = 64;

/// Dial attempts per ensure-minimum-peers round, as a multiple of the
/// minimum peer count. Dialing strangers fails far more often than it
/// succeeds.
const DIAL_FACTOR: usize = 10;

/// State shared between the supervisor loop, dial workers and peer
/// on-quit callbacks.
pub struct NodeState {
    config: NodeConfig,
    /// Live peers, keyed by remote address.
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    /// Addresses of live peers.
    connected_addrs: RwLock<HashSet<PeerId>>,
    /// Known addresses not currently connected.
    unconnected_addrs: RwLock<HashSet<PeerId>>,
    store: BlockStore,
    events_tx: mpsc::Sender<PeerEvent>,
    add_peers_tx: mpsc::Sender<()>,
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,
    has_quit: Mutex<bool>,
}

/// The supervisor. Owns the event-loop ends of the channels; everything
/// else lives in [`NodeState`].
pub struct Node {
    state: Arc<NodeState>,
    events_rx: mpsc::Receiver<PeerEvent>,
    add_peers_rx: mpsc::Receiver<()>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        // Single-slot: the signal only records that a refill is due.
        let (add_peers_tx, add_peers_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = watch::channel(false);

        let state = Arc::new(NodeState {
            config,
            peers: RwLock::new(HashMap::new()),
            connected_addrs: RwLock::new(HashSet::new()),
            unconnected_addrs: RwLock::new(HashSet::new()),
            store: BlockStore::new(),
            events_tx,
            add_peers_tx,
            quit_tx,
            quit_rx,
            has_quit: Mutex::new(false),
        });

        Self {
            state,
            events_rx,
            add_peers_rx,
        }
    }

    /// Shared handle used by the signal handler, tests and dial workers.
    pub fn state(&self) -> Arc<NodeState> {
        Arc::clone(&self.state)
    }

    /// Drive the event loop until the node quits.
    pub async fn run(mut self) {
        if self.state.peer_count() < self.state.config.min_peers {
            self.state.notify_add_peers();
        }

        let mut quit_rx = self.state.quit_rx.clone();
        let tick = self.state.config.tick_interval;
        let mut ticker = interval_at(Instant::now() + tick, tick);

        loop {
            tokio::select! {
                _ = quit_rx.changed() => {
                    debug!("supervisor loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.state.handle_tick().await {
                        warn!(error = %e, "sync tick failed");
                    }
                }
                Some(()) = self.add_peers_rx.recv() => {
                    self.state.ensure_minimum_peers().await;
                }
                Some(event) = self.events_rx.recv() => {
                    self.state.handle_event(event).await;
                }
            }
        }
    }
}

impl NodeState {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn has_quit(&self) -> bool {
        *self.has_quit.lock()
    }

    /// Load the block snapshot, if one exists.
    pub fn restore_blocks(&self) -> StoreResult<usize> {
        self.store.restore(&self.config.blocks_file)
    }

    /// Dial `addr`, run the handshake, and register the resulting peer.
    pub async fn add_peer(
        self: &Arc<Self>,
        addr: SocketAddr,
        remote_services: Services,
    ) -> NetworkResult<Arc<Peer>> {
        let (stream, version) =
            perform_handshake(addr, &self.config.handshake_config(), remote_services).await?;
        info!(peer = %addr, version = version.version, agent = %version.user_agent, "peer connected");

        let weak = Arc::downgrade(self);
        let peer = Peer::new(
            stream,
            Box::new(move |id| {
                if let Some(state) = weak.upgrade() {
                    state.remove_peer(id);
                }
            }),
            self.events_tx.clone(),
        )?;

        self.register_peer(&peer);
        peer.start();
        Ok(peer)
    }

    /// Terminate every peer, persist the block set, and stop the loop.
    /// Idempotent.
    pub fn quit(&self) {
        {
            let mut has_quit = self.has_quit.lock();
            if *has_quit {
                return;
            }
            *has_quit = true;
        }
        info!("quitting node");

        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            peer.quit();
        }
        let _ = self.quit_tx.send(true);

        match self.store.dump(&self.config.blocks_file) {
            Ok(count) => {
                info!(count, path = %self.config.blocks_file.display(), "saved block snapshot");
            }
            Err(e) => warn!(error = %e, "could not save block snapshot"),
        }
    }

    fn register_peer(&self, peer: &Arc<Peer>) {
        let id = peer.id();
        self.peers.write().insert(id, Arc::clone(peer));
        self.connected_addrs.write().insert(id);
        self.unconnected_addrs.write().remove(&id);
    }

    fn remove_peer(&self, id: PeerId) {
        let remaining = {
            let mut peers = self.peers.write();
            peers.remove(&id);
            peers.len()
        };
        self.connected_addrs.write().remove(&id);
        info!(peer = %id, remaining, "removed peer");

        if remaining < self.config.min_peers {
            self.notify_add_peers();
        }
    }

    fn notify_add_peers(&self) {
        if self.add_peers_tx.try_send(()).is_err() {
            debug!("add-peers signal already pending");
        }
    }

    fn live_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    fn random_peer(&self) -> Option<Arc<Peer>> {
        let peers = self.peers.read();
        let live: Vec<&Arc<Peer>> = peers.values().collect();
        live.choose(&mut rand::thread_rng())
            .map(|peer| Arc::clone(peer))
    }

    /// Periodic sync action: chase missing parents if there are any,
    /// otherwise ask for blocks past our tip.
    async fn handle_tick(&self) -> NetworkResult<()> {
        let missing = self.store.missing_parent_hashes();
        if !missing.is_empty() {
            if let Some(peer) = self.random_peer() {
                debug!(peer = %peer.id(), count = missing.len(), "requesting missing parent blocks");
                peer.request_block_data(missing).await?;
            }
            return Ok(());
        }
        self.request_new_blocks().await
    }

    /// Send a getblocks with a one-element locator: our tip, or the
    /// genesis hash when the block set is empty. The zero hash-stop asks
    /// for as many blocks as the peer will return (500).
    async fn request_new_blocks(&self) -> NetworkResult<()> {
        let locator = self.store.tip_hash().unwrap_or(GENESIS_BLOCK_HASH);
        let Some(peer) = self.random_peer() else {
            return Ok(());
        };
        debug!(peer = %peer.id(), tip = %locator, "requesting blocks past tip");
        peer.request_blocks(
            self.config.protocol_version as u32,
            vec![locator],
            Hash256::ZERO,
        )
        .await
    }

    async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Inv { from, payload } => {
                if let Err(e) = self.handle_inv(from, payload).await {
                    warn!(peer = %from, error = %e, "inv handling failed, dropping peer");
                    self.quit_peer(from);
                }
            }
            PeerEvent::Block { from, payload } => {
                if let Err(e) = self.handle_block(from, payload).await {
                    warn!(peer = %from, error = %e, "block handling failed, dropping peer");
                    self.quit_peer(from);
                }
            }
        }
    }

    /// Events may arrive from peers the supervisor already forgot; those
    /// are quietly ignored.
    fn quit_peer(&self, id: PeerId) {
        if let Some(peer) = self.live_peer(&id) {
            peer.quit();
        }
    }

    /// Request block data for every advertised block hash we do not hold.
    async fn handle_inv(&self, from: PeerId, payload: InvPayload) -> NetworkResult<()> {
        let wanted: Vec<Hash256> = payload
            .inventories
            .iter()
            .filter(|inv| inv.kind.is_block() && !self.store.contains(&inv.hash))
            .map(|inv| inv.hash)
            .collect();
        debug!(peer = %from, count = wanted.len(), "new blocks advertised");
        if wanted.is_empty() {
            return Ok(());
        }
        let Some(peer) = self.live_peer(&from) else {
            return Ok(());
        };
        peer.request_block_data(wanted).await
    }

    /// Ingest a block, then chase any parents we are now missing. The
    /// sender just proved it is responsive, so it gets the follow-up
    /// request rather than a random peer.
    async fn handle_block(&self, from: PeerId, payload: BlockPayload) -> NetworkResult<()> {
        let hash = payload.block_hash();
        if self.store.insert(payload) {
            info!(peer = %from, block = %hash, total = self.store.len(), "stored block");
        }

        let missing = self.store.missing_parent_hashes();
        if missing.is_empty() {
            return Ok(());
        }
        debug!(count = missing.len(), "blocks missing a stored parent");
        let Some(peer) = self.live_peer(&from) else {
            return Ok(());
        };
        peer.request_block_data(missing).await
    }

    /// Refill the pool up to the configured minimum.
    ///
    /// With no peers and no addresses left the node is stuck and quits.
    /// Otherwise: top up the unconnected address set via getaddr when it
    /// cannot cover the deficit, dial a batch of addresses in parallel,
    /// and re-arm the signal if the pool is still short.
    async fn ensure_minimum_peers(self: &Arc<Self>) {
        let live = self.peer_count();
        let unconnected = self.unconnected_addrs.read().len();

        if live == 0 && unconnected == 0 {
            warn!("no peers and no addresses left to try, giving up");
            self.quit();
            return;
        }
        if live >= self.config.min_peers {
            return;
        }
        warn!(live, minimum = self.config.min_peers, "below minimum peer count");

        let deficit = self.config.min_peers - live;
        if unconnected < deficit {
            if let Some(peer) = self.random_peer() {
                self.refill_addresses(&peer).await;
            }
        }

        let added = self.dial_new_peers(self.config.min_peers * DIAL_FACTOR).await;
        info!(added, live = self.peer_count(), "dial round finished");

        if self.peer_count() < self.config.min_peers {
            self.notify_add_peers();
        }
    }

    /// Ask one live peer for addresses and merge the reply into the
    /// unconnected set. A peer that does not answer within the deadline
    /// is terminated.
    async fn refill_addresses(&self, peer: &Arc<Peer>) {
        let receiver = match peer.request_addresses().await {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "getaddr request failed");
                return;
            }
        };

        match tokio::time::timeout(self.config.getaddr_wait, receiver).await {
            Ok(Ok(addresses)) => {
                let count = addresses.len();
                let mut fresh = 0;
                for address in addresses {
                    if self.add_unconnected_addr(PeerId::from_network_address(&address.address)) {
                        fresh += 1;
                    }
                }
                info!(peer = %peer.id(), count, fresh, "received addresses");
            }
            Ok(Err(_)) => {
                debug!(peer = %peer.id(), "peer quit before answering getaddr");
            }
            Err(_) => {
                warn!(peer = %peer.id(), "no getaddr reply in time, dropping peer");
                peer.quit();
            }
        }
    }

    fn add_unconnected_addr(&self, id: PeerId) -> bool {
        if self.connected_addrs.read().contains(&id) {
            return false;
        }
        self.unconnected_addrs.write().insert(id)
    }

    /// Dial up to `max_dials` unconnected addresses in parallel and
    /// count the handshakes that succeed. Failed addresses are
    /// discarded, not retried.
    async fn dial_new_peers(self: &Arc<Self>, max_dials: usize) -> usize {
        let mut dials = JoinSet::new();
        for _ in 0..max_dials {
            let Some(id) = self.pop_unconnected_addr() else {
                break;
            };
            let state = Arc::clone(self);
            dials.spawn(async move {
                match state.add_peer(id.to_socket_addr(), Services::NODE_NETWORK).await {
                    Ok(_) => true,
                    Err(e) => {
                        debug!(addr = %id, error = %e, "dial failed");
                        false
                    }
                }
            });
        }

        let mut added = 0;
        while let Some(result) = dials.join_next().await {
            if matches!(result, Ok(true)) {
                added += 1;
            }
        }
        added
    }

    fn pop_unconnected_addr(&self) -> Option<PeerId> {
        let mut addrs = self.unconnected_addrs.write();
        let id = addrs.iter().next().copied()?;
        addrs.remove(&id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_block(prev: Hash256, timestamp: u32) -> BlockPayload {
        BlockPayload {
            version: 1,
            prev_block: prev,
            merkle_root: Hash256([0x55; 32]),
            timestamp,
            bits: 0x1D00_FFFF,
            nonce: 0,
            transactions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_node_with_nothing_left_quits_on_refill() {
        let node = Node::new(NodeConfig {
            min_peers: 1,
            ..NodeConfig::default()
        });
        let state = node.state();

        state.ensure_minimum_peers().await;
        assert!(state.has_quit());
    }

    #[tokio::test]
    async fn test_quit_is_idempotent() {
        let node = Node::new(NodeConfig::default());
        let state = node.state();

        state.quit();
        state.quit();
        assert!(state.has_quit());
    }

    #[tokio::test]
    async fn test_block_events_from_forgotten_peers_still_ingest() {
        let node = Node::new(NodeConfig::default());
        let state = node.state();

        let ghost = PeerId::from_socket_addr(&"127.0.0.1:18333".parse().unwrap());
        let block = test_block(Hash256::ZERO, 1);
        let hash = block.block_hash();

        state
            .handle_event(PeerEvent::Block {
                from: ghost,
                payload: block,
            })
            .await;
        assert!(state.store().contains(&hash));
    }

    #[tokio::test]
    async fn test_chain_closure_under_parent() {
        let node = Node::new(NodeConfig::default());
        let state = node.state();
        let ghost = PeerId::from_socket_addr(&"127.0.0.1:18333".parse().unwrap());

        let parent = test_block(Hash256::ZERO, 1);
        let child = test_block(parent.block_hash(), 2);
        for block in [parent, child] {
            state
                .handle_event(PeerEvent::Block {
                    from: ghost,
                    payload: block,
                })
                .await;
        }

        // every stored block's parent is either held or the zero hash
        assert!(state.store().missing_parent_hashes().is_empty());
        assert_eq!(state.store().len(), 2);
    }
}
