use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use itertools::Itertools as _;
use log::{debug, info, warn};
use types::{BlockNumber, SnailBlock, SnailHeader, H256, U256};

use crate::{
    fetcher::{ImportOutcome, ImportSink},
    messages::{HeaderQuery, Message},
    peers::{PeerId, PeerSet, PeerTransport},
};

pub type RequestId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncStatus {
    Idle,
    SyncingHeaders,
    SyncingBodies,
}

#[derive(Clone, Copy, Debug)]
pub struct DownloaderConfig {
    pub header_batch: u64,
    pub bodies_per_request: usize,
    pub request_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            header_batch: 192,
            bodies_per_request: 16,
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct Session {
    target_peer: PeerId,
    target_td: U256,
    next_header_from: BlockNumber,
    pending_headers: Option<(RequestId, Instant)>,
    pending_bodies: HashMap<RequestId, (PeerId, Vec<SnailHeader>, Instant)>,
    /// Validated headers whose bodies are not yet requested.
    body_queue: Vec<SnailHeader>,
    /// Bodies received out of order, waiting for their turn to import.
    received: BTreeMap<BlockNumber, SnailBlock>,
    next_import: BlockNumber,
    headers_done: bool,
}

/// Long-range snail-chain synchronization.
///
/// Headers stream in batches from the single best peer and are validated
/// for linkage; bodies are then pulled in parallel from every idle peer.
/// A session is cancellable at any point, which abandons outstanding
/// requests and frees the peers.
pub struct Downloader {
    config: DownloaderConfig,
    peers: Arc<PeerSet>,
    transport: Arc<dyn PeerTransport>,
    sink: Arc<dyn ImportSink>,
    session: Option<Session>,
    next_request_id: RequestId,
}

impl Downloader {
    #[must_use]
    pub fn new(
        config: DownloaderConfig,
        peers: Arc<PeerSet>,
        transport: Arc<dyn PeerTransport>,
        sink: Arc<dyn ImportSink>,
    ) -> Self {
        Self {
            config,
            peers,
            transport,
            sink,
            session: None,
            next_request_id: 0,
        }
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        match &self.session {
            None => SyncStatus::Idle,
            Some(session) if session.headers_done => SyncStatus::SyncingBodies,
            Some(_) => SyncStatus::SyncingHeaders,
        }
    }

    /// Begins a sync session against the best peer if it advertises a
    /// heavier chain than ours.
    pub fn start_sync(&mut self, local_td: U256, local_head: BlockNumber) -> Result<()> {
        if self.session.is_some() {
            return Err(anyhow!("a sync session is already running"));
        }

        let (peer, info) = self
            .peers
            .best_peer()
            .ok_or_else(|| anyhow!("no peers to sync from"))?;
        if info.snail_total_difficulty <= local_td {
            return Err(anyhow!("no peer advertises a heavier chain"));
        }

        info!(
            "starting snail sync ({peer}, td: {}, from: {})",
            info.snail_total_difficulty,
            local_head + 1,
        );

        let mut session = Session {
            target_peer: peer,
            target_td: info.snail_total_difficulty,
            next_header_from: local_head + 1,
            pending_headers: None,
            pending_bodies: HashMap::new(),
            body_queue: vec![],
            received: BTreeMap::new(),
            next_import: local_head + 1,
            headers_done: false,
        };
        self.request_headers(&mut session);
        self.session = Some(session);
        Ok(())
    }

    /// Abandons the session; outstanding requests are forgotten and their
    /// peers freed.
    pub fn cancel(&mut self) {
        if let Some(session) = self.session.take() {
            info!("sync session cancelled");
            self.peers.mark_idle(session.target_peer);
            for (peer, _, _) in session.pending_bodies.values() {
                self.peers.mark_idle(*peer);
            }
        }
    }

    pub fn on_headers(
        &mut self,
        peer: PeerId,
        request_id: RequestId,
        headers: Vec<SnailHeader>,
    ) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let expected = session
            .pending_headers
            .is_some_and(|(pending_id, _)| pending_id == request_id);
        if !expected || peer != session.target_peer {
            self.session = Some(session);
            return;
        }
        session.pending_headers = None;
        self.peers.mark_idle(peer);

        // Linkage validation; a bad batch ends the session and the peer.
        let contiguous = headers
            .iter()
            .tuple_windows()
            .all(|(a, b)| b.number == a.number + 1 && b.parent_hash == a.hash());
        let starts_right = headers
            .first()
            .is_none_or(|first| first.number == session.next_header_from);
        if !contiguous || !starts_right {
            warn!("invalid header batch from {peer}");
            if self.peers.record_misbehavior(peer, 60, "invalid header batch") {
                self.transport.disconnect(peer);
            }
            self.cancel_session(session);
            return;
        }

        let batch_len = headers.len() as u64;
        session.next_header_from += batch_len;
        session.body_queue.extend(headers);

        if batch_len < self.config.header_batch {
            session.headers_done = true;
            debug!("header phase complete at {}", session.next_header_from - 1);
        } else {
            self.request_headers(&mut session);
        }

        self.dispatch_bodies(&mut session);
        self.finish_or_store(session);
    }

    pub fn on_bodies(&mut self, peer: PeerId, request_id: RequestId, blocks: Vec<SnailBlock>) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let Some((expected_peer, requested, _)) = session.pending_bodies.remove(&request_id)
        else {
            self.session = Some(session);
            return;
        };
        self.peers.mark_idle(peer);

        if expected_peer != peer {
            self.session = Some(session);
            return;
        }

        let hashes = requested.iter().map(SnailHeader::hash).collect_vec();
        for block in blocks {
            if hashes.contains(&block.hash()) {
                let _previous = session.received.insert(block.number(), block);
            }
        }

        // Anything the peer failed to serve goes back to the queue.
        let served = session
            .received
            .values()
            .map(SnailBlock::hash)
            .collect_vec();
        session
            .body_queue
            .extend(
                requested
                    .into_iter()
                    .filter(|header| !served.contains(&header.hash())),
            );

        self.import_ready(&mut session);
        self.dispatch_bodies(&mut session);
        self.finish_or_store(session);
    }

    /// Expires overdue requests. Header timeouts abort the session; body
    /// timeouts requeue the hashes for other peers.
    pub fn poll_timeouts(&mut self, now: Instant) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if session
            .pending_headers
            .is_some_and(|(_, started)| now.saturating_duration_since(started) > self.config.request_timeout)
        {
            warn!("header request to {} timed out", session.target_peer);
            if self
                .peers
                .record_misbehavior(session.target_peer, 40, "header timeout")
            {
                self.transport.disconnect(session.target_peer);
            }
            self.cancel_session(session);
            return;
        }

        let expired = session
            .pending_bodies
            .iter()
            .filter(|(_, (_, _, started))| {
                now.saturating_duration_since(*started) > self.config.request_timeout
            })
            .map(|(request_id, _)| *request_id)
            .collect_vec();

        for request_id in expired {
            let Some((peer, requested, _)) = session.pending_bodies.remove(&request_id) else {
                continue;
            };
            debug!("body request {request_id} to {peer} timed out, requeueing");
            self.peers.mark_idle(peer);
            if self.peers.record_misbehavior(peer, 40, "body timeout") {
                self.transport.disconnect(peer);
            }
            // Headers are already validated; re-dispatch them elsewhere.
            session.body_queue.extend(requested);
        }

        self.dispatch_bodies(&mut session);
        self.finish_or_store(session);
    }

    fn request_headers(&mut self, session: &mut Session) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let query = HeaderQuery {
            request_id,
            from: session.next_header_from,
            amount: self.config.header_batch,
            skip: 0,
            reverse: false,
        };
        session.pending_headers = Some((request_id, Instant::now()));
        self.peers.mark_requesting(session.target_peer, request_id);
        self.transport
            .send(session.target_peer, Message::GetSnailBlockHeaders(query));
    }

    /// Hands body work to every idle peer, a chunk per peer.
    fn dispatch_bodies(&mut self, session: &mut Session) {
        for peer in self.peers.idle_peers() {
            if session.body_queue.is_empty() {
                break;
            }

            let take = self.config.bodies_per_request.min(session.body_queue.len());
            let chunk = session.body_queue.drain(..take).collect_vec();
            let hashes = chunk.iter().map(SnailHeader::hash).collect_vec();

            let request_id = self.next_request_id;
            self.next_request_id += 1;

            let _previous = session
                .pending_bodies
                .insert(request_id, (peer, chunk, Instant::now()));
            self.peers.mark_requesting(peer, request_id);
            self.transport
                .send(peer, Message::GetSnailBlockBodies(request_id, hashes));
        }
    }

    /// Imports every block whose predecessors have all arrived.
    fn import_ready(&mut self, session: &mut Session) {
        while let Some(block) = session.received.remove(&session.next_import) {
            match self.sink.import(block) {
                Ok(ImportOutcome::Imported | ImportOutcome::Known) => {
                    session.next_import += 1;
                }
                Ok(ImportOutcome::MissingParent) => {
                    warn!("sync import hit a gap at {}", session.next_import);
                    break;
                }
                Err(error) => {
                    warn!("sync import failed at {}: {error}", session.next_import);
                    break;
                }
            }
        }
    }

    fn finish_or_store(&mut self, session: Session) {
        let finished = session.headers_done
            && session.body_queue.is_empty()
            && session.pending_bodies.is_empty()
            && session.received.is_empty();

        if finished {
            info!(
                "snail sync complete (head: {}, target td: {})",
                session.next_import.saturating_sub(1),
                session.target_td,
            );
            self.peers.mark_idle(session.target_peer);
            self.session = None;
        } else {
            self.session = Some(session);
        }
    }

    fn cancel_session(&mut self, session: Session) {
        for (peer, _, _) in session.pending_bodies.values() {
            self.peers.mark_idle(*peer);
        }
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(PeerId, Message)>>,
    }

    impl PeerTransport for RecordingTransport {
        fn send(&self, peer: PeerId, message: Message) {
            self.sent.lock().push((peer, message));
        }

        fn disconnect(&self, _: PeerId) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        imported: Mutex<Vec<BlockNumber>>,
    }

    impl ImportSink for RecordingSink {
        fn import(&self, block: SnailBlock) -> anyhow::Result<ImportOutcome> {
            self.imported.lock().push(block.number());
            Ok(ImportOutcome::Imported)
        }

        fn has_block(&self, _: H256) -> bool {
            false
        }

        fn head_number(&self) -> BlockNumber {
            self.imported.lock().last().copied().unwrap_or(0)
        }
    }

    fn chain(length: u64) -> Vec<SnailBlock> {
        let mut blocks = vec![];
        let mut parent_hash = H256::zero();
        for number in 1..=length {
            let block = SnailBlock::new(
                SnailHeader {
                    parent_hash,
                    number,
                    time: number * 60,
                    difficulty: U256::from(1000),
                    ..SnailHeader::default()
                },
                vec![],
                vec![],
            );
            parent_hash = block.hash();
            blocks.push(block);
        }
        blocks
    }

    struct Setup {
        downloader: Downloader,
        transport: Arc<RecordingTransport>,
        sink: Arc<RecordingSink>,
        peers: Arc<PeerSet>,
    }

    fn setup(config: DownloaderConfig) -> Setup {
        let peers = Arc::new(PeerSet::default());
        peers.register(PeerId(1));
        peers.complete_handshake(PeerId(1), 50, U256::from(1_000_000), H256::repeat_byte(1));

        let transport = Arc::new(RecordingTransport::default());
        let sink = Arc::new(RecordingSink::default());

        let downloader = Downloader::new(
            config,
            Arc::clone(&peers),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            Arc::clone(&sink) as Arc<dyn ImportSink>,
        );

        Setup {
            downloader,
            transport,
            sink,
            peers,
        }
    }

    #[test]
    fn sync_requires_a_heavier_peer() {
        let mut setup = setup(DownloaderConfig::default());

        assert!(setup
            .downloader
            .start_sync(U256::from(2_000_000), 10)
            .is_err());
        assert!(setup.downloader.start_sync(U256::from(10), 10).is_ok());
        assert_eq!(setup.downloader.status(), SyncStatus::SyncingHeaders);
    }

    #[test]
    fn full_session_imports_blocks_in_order() {
        let config = DownloaderConfig {
            header_batch: 16,
            bodies_per_request: 2,
            ..DownloaderConfig::default()
        };
        let mut setup = setup(config);
        let blocks = chain(3);

        setup
            .downloader
            .start_sync(U256::zero(), 0)
            .expect("peer 1 is heavier");

        // The header request went to the best peer.
        let (peer, request) = setup.transport.sent.lock()[0].clone();
        assert_eq!(peer, PeerId(1));
        let Message::GetSnailBlockHeaders(query) = request else {
            panic!("expected a header request");
        };
        assert_eq!(query.from, 1);

        // A short batch completes the header phase and triggers body fetch.
        let headers = blocks
            .iter()
            .map(|block| block.header().clone())
            .collect_vec();
        setup
            .downloader
            .on_headers(PeerId(1), query.request_id, headers);
        assert_eq!(setup.downloader.status(), SyncStatus::SyncingBodies);

        // Serve body requests as they appear; one idle peer means the
        // three headers go out over two consecutive requests.
        let mut cursor = 1;
        for _ in 0..10 {
            if setup.downloader.status() == SyncStatus::Idle {
                break;
            }
            let pending = setup.transport.sent.lock()[cursor..].to_vec();
            cursor += pending.len();
            for (peer, message) in pending {
                let Message::GetSnailBlockBodies(request_id, hashes) = message else {
                    panic!("expected a body request");
                };
                let served = blocks
                    .iter()
                    .filter(|block| hashes.contains(&block.hash()))
                    .cloned()
                    .collect_vec();
                setup.downloader.on_bodies(peer, request_id, served);
            }
        }

        assert_eq!(setup.downloader.status(), SyncStatus::Idle);
        assert_eq!(*setup.sink.imported.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_frees_the_peers() {
        let mut setup = setup(DownloaderConfig::default());
        setup
            .downloader
            .start_sync(U256::zero(), 0)
            .expect("peer 1 is heavier");

        setup.downloader.cancel();
        assert_eq!(setup.downloader.status(), SyncStatus::Idle);
        assert_eq!(setup.peers.idle_peers(), vec![PeerId(1)]);
    }

    #[test]
    fn header_timeout_aborts_the_session() {
        let mut setup = setup(DownloaderConfig::default());
        setup
            .downloader
            .start_sync(U256::zero(), 0)
            .expect("peer 1 is heavier");

        setup
            .downloader
            .poll_timeouts(Instant::now() + Duration::from_secs(60));
        assert_eq!(setup.downloader.status(), SyncStatus::Idle);
    }

    #[test]
    fn invalid_header_batch_penalizes_and_aborts() {
        let mut setup = setup(DownloaderConfig::default());
        setup
            .downloader
            .start_sync(U256::zero(), 0)
            .expect("peer 1 is heavier");

        let mut headers = chain(3)
            .iter()
            .map(|block| block.header().clone())
            .collect_vec();
        headers[2].parent_hash = H256::repeat_byte(0x66);

        setup.downloader.on_headers(PeerId(1), 0, headers);
        assert_eq!(setup.downloader.status(), SyncStatus::Idle);
    }
}
