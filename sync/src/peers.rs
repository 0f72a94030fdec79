use std::collections::HashMap;

use derive_more::Display;
use log::{debug, info};
use parking_lot::RwLock;
use types::{BlockNumber, H256, U256};

use crate::messages::Message;

/// Misbehavior score at which a peer is dropped.
const DROP_SCORE: u32 = 100;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
#[display("peer-{_0}")]
pub struct PeerId(pub u64);

/// Outbound side of the framed duplex channel per peer. The transport
/// itself is an external collaborator.
pub trait PeerTransport: Send + Sync {
    fn send(&self, peer: PeerId, message: Message);
    fn disconnect(&self, peer: PeerId);
}

/// Per-peer protocol state machine: `Handshaking → Idle → Requesting →
/// Idle`, with a drop sink on misbehavior or disconnect.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PeerState {
    Handshaking,
    Idle,
    Requesting { request_id: u64 },
}

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub state: PeerState,
    pub fast_height: BlockNumber,
    pub snail_total_difficulty: U256,
    pub snail_head_hash: H256,
    score: u32,
}

#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl PeerSet {
    pub fn register(&self, peer: PeerId) {
        let _previous = self.peers.write().insert(
            peer,
            PeerInfo {
                state: PeerState::Handshaking,
                fast_height: 0,
                snail_total_difficulty: U256::zero(),
                snail_head_hash: H256::zero(),
                score: 0,
            },
        );
        debug!("registered {peer}");
    }

    pub fn deregister(&self, peer: PeerId) {
        if self.peers.write().remove(&peer).is_some() {
            debug!("deregistered {peer}");
        }
    }

    pub fn complete_handshake(
        &self,
        peer: PeerId,
        fast_height: BlockNumber,
        snail_total_difficulty: U256,
        snail_head_hash: H256,
    ) {
        if let Some(info) = self.peers.write().get_mut(&peer) {
            info.state = PeerState::Idle;
            info.fast_height = fast_height;
            info.snail_total_difficulty = snail_total_difficulty;
            info.snail_head_hash = snail_head_hash;
        }
    }

    #[must_use]
    pub fn get(&self, peer: PeerId) -> Option<PeerInfo> {
        self.peers.read().get(&peer).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Peer advertising the heaviest snail chain; sync targets it.
    #[must_use]
    pub fn best_peer(&self) -> Option<(PeerId, PeerInfo)> {
        self.peers
            .read()
            .iter()
            .filter(|(_, info)| info.state != PeerState::Handshaking)
            .max_by_key(|(_, info)| info.snail_total_difficulty)
            .map(|(peer, info)| (*peer, info.clone()))
    }

    #[must_use]
    pub fn idle_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .iter()
            .filter(|(_, info)| info.state == PeerState::Idle)
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn mark_requesting(&self, peer: PeerId, request_id: u64) {
        if let Some(info) = self.peers.write().get_mut(&peer) {
            info.state = PeerState::Requesting { request_id };
        }
    }

    pub fn mark_idle(&self, peer: PeerId) {
        if let Some(info) = self.peers.write().get_mut(&peer) {
            info.state = PeerState::Idle;
        }
    }

    /// Raises the peer's misbehavior score. Returns true once the peer has
    /// crossed the drop threshold; the caller disconnects and deregisters.
    #[must_use]
    pub fn record_misbehavior(&self, peer: PeerId, weight: u32, reason: &str) -> bool {
        let mut peers = self.peers.write();
        let Some(info) = peers.get_mut(&peer) else {
            return false;
        };

        info.score = info.score.saturating_add(weight);
        debug!("{peer} misbehaved (reason: {reason}, score: {})", info.score);

        if info.score >= DROP_SCORE {
            info!("dropping {peer} (reason: {reason})");
            let _removed = peers.remove(&peer);
            true
        } else {
            false
        }
    }
}
