use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use log::debug;
use lru::LruCache;
use types::{BlockNumber, SnailBlock, H256};

use crate::{
    messages::Message,
    peers::{PeerId, PeerSet, PeerTransport},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImportOutcome {
    Imported,
    /// Parent not yet known; the fetcher holds the block until it is.
    MissingParent,
    Known,
}

/// Import half of the chain, injected by the coordinator.
pub trait ImportSink: Send + Sync {
    fn import(&self, block: SnailBlock) -> anyhow::Result<ImportOutcome>;
    fn has_block(&self, hash: H256) -> bool;
    fn head_number(&self) -> BlockNumber;
}

#[derive(Clone, Copy, Debug)]
pub struct FetcherConfig {
    /// Outstanding announcements tolerated per peer before it is penalized.
    pub announce_limit_per_peer: usize,
    pub fetch_timeout: Duration,
    /// How far ahead of the head a held block may be.
    pub max_hold_distance: u64,
    pub dedupe_capacity: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            announce_limit_per_peer: 256,
            fetch_timeout: Duration::from_secs(5),
            max_hold_distance: 64,
            dedupe_capacity: 4096,
        }
    }
}

/// Low-latency block propagation.
///
/// Announcements are deduped per hash, counted per peer, fetched with a
/// matched request id, and imported strictly parent before child via a
/// small hold queue.
pub struct Fetcher {
    config: FetcherConfig,
    peers: Arc<PeerSet>,
    transport: Arc<dyn PeerTransport>,
    sink: Arc<dyn ImportSink>,
    seen: LruCache<H256, ()>,
    announce_counts: HashMap<PeerId, usize>,
    inflight: HashMap<u64, (PeerId, H256, Instant)>,
    held: BTreeMap<BlockNumber, Vec<SnailBlock>>,
    next_request_id: u64,
}

impl Fetcher {
    #[must_use]
    pub fn new(
        config: FetcherConfig,
        peers: Arc<PeerSet>,
        transport: Arc<dyn PeerTransport>,
        sink: Arc<dyn ImportSink>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.dedupe_capacity.max(1))
            .expect("capacity is at least one");
        Self {
            config,
            peers,
            transport,
            sink,
            seen: LruCache::new(capacity),
            announce_counts: HashMap::new(),
            inflight: HashMap::new(),
            held: BTreeMap::new(),
            next_request_id: 0,
        }
    }

    /// Handles a `NewSnailBlockHashes` announcement entry.
    pub fn on_announce(&mut self, peer: PeerId, hash: H256, number: BlockNumber) {
        if self.seen.contains(&hash) || self.sink.has_block(hash) {
            return;
        }

        let count = self.announce_counts.entry(peer).or_insert(0);
        *count += 1;
        if *count > self.config.announce_limit_per_peer {
            if self.peers.record_misbehavior(peer, 30, "announce flood") {
                self.transport.disconnect(peer);
                self.forget_peer(peer);
            }
            return;
        }

        if number > self.sink.head_number() + self.config.max_hold_distance {
            debug!("ignoring far-future announce from {peer} (number: {number})");
            return;
        }

        let _evicted = self.seen.push(hash, ());

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let _previous = self
            .inflight
            .insert(request_id, (peer, hash, Instant::now()));
        self.transport
            .send(peer, Message::GetSnailBlockBodies(request_id, vec![hash]));
    }

    /// Handles a `SnailBlockBodies` response matched by request id.
    pub fn on_bodies(&mut self, peer: PeerId, request_id: u64, blocks: Vec<SnailBlock>) {
        let Some((expected_peer, expected_hash, _)) = self.inflight.remove(&request_id) else {
            // Unsolicited response.
            if self.peers.record_misbehavior(peer, 10, "unsolicited bodies") {
                self.transport.disconnect(peer);
                self.forget_peer(peer);
            }
            return;
        };

        if expected_peer != peer {
            return;
        }
        if let Some(count) = self.announce_counts.get_mut(&peer) {
            *count = count.saturating_sub(1);
        }

        let Some(block) = blocks
            .into_iter()
            .find(|block| block.hash() == expected_hash)
        else {
            // The peer announced a hash it cannot serve.
            if self.peers.record_misbehavior(peer, 25, "announced unknown hash") {
                self.transport.disconnect(peer);
                self.forget_peer(peer);
            }
            return;
        };

        self.enqueue(peer, block);
    }

    /// Handles a directly pushed `NewSnailBlock`.
    pub fn on_block(&mut self, peer: PeerId, block: SnailBlock) {
        let _evicted = self.seen.push(block.hash(), ());
        self.enqueue(peer, block);
    }

    /// Expires overdue fetches; each one penalizes the serving peer.
    pub fn poll_timeouts(&mut self, now: Instant) {
        let expired = self
            .inflight
            .iter()
            .filter(|(_, (_, _, started))| {
                now.saturating_duration_since(*started) > self.config.fetch_timeout
            })
            .map(|(request_id, _)| *request_id)
            .collect::<Vec<_>>();

        for request_id in expired {
            let Some((peer, hash, _)) = self.inflight.remove(&request_id) else {
                continue;
            };
            debug!("fetch of {hash} from {peer} timed out");
            let _evicted = self.seen.pop(&hash);
            if self.peers.record_misbehavior(peer, 20, "fetch timeout") {
                self.transport.disconnect(peer);
                self.forget_peer(peer);
            }
        }
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        self.forget_peer(peer);
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.values().map(Vec::len).sum()
    }

    /// Imports in parent-before-child order; a block whose parent is still
    /// missing waits in the hold queue, bounded by distance from the head.
    fn enqueue(&mut self, peer: PeerId, block: SnailBlock) {
        let number = block.number();
        if number > self.sink.head_number() + self.config.max_hold_distance {
            return;
        }

        match self.sink.import(block.clone()) {
            Ok(ImportOutcome::Imported) => {
                self.drain_held(number + 1);
            }
            Ok(ImportOutcome::MissingParent) => {
                self.held.entry(number).or_default().push(block);
            }
            Ok(ImportOutcome::Known) => {}
            Err(error) => {
                debug!("import of block from {peer} failed: {error}");
                if self.peers.record_misbehavior(peer, 50, "invalid block") {
                    self.transport.disconnect(peer);
                    self.forget_peer(peer);
                }
            }
        }
    }

    fn drain_held(&mut self, mut number: BlockNumber) {
        while let Some(blocks) = self.held.remove(&number) {
            let mut progressed = false;
            let mut still_held = vec![];

            for block in blocks {
                match self.sink.import(block.clone()) {
                    Ok(ImportOutcome::Imported | ImportOutcome::Known) => progressed = true,
                    Ok(ImportOutcome::MissingParent) => still_held.push(block),
                    Err(error) => debug!("import of held block failed: {error}"),
                }
            }

            if !still_held.is_empty() {
                let _previous = self.held.insert(number, still_held);
            }
            if !progressed {
                break;
            }
            number += 1;
        }
    }

    fn forget_peer(&mut self, peer: PeerId) {
        let _removed = self.announce_counts.remove(&peer);
        self.inflight.retain(|_, (owner, _, _)| *owner != peer);
    }
}
