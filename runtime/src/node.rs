use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use database::Database;
use election::Election;
use fast_chain::FastChain;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::{debug, info, warn};
use minerva::{Minerva, Mode};
use snail_chain::SnailChain;
use snail_pool::SnailPool;
use tbft::{ConsensusMessage, Engine, EvidencePool, TbftConfig};
use tokio::{sync::watch, task::JoinHandle};
use tx_pool::{PoolConfig, TxPool};
use types::{ChainConfig, Transaction};

use crate::{
    handles::{
        Agent, Commit, Committees, FastReader, FruitPoolReader, LateBoundVerifier, PendingView,
        PoolStateReader, SnailReader,
    },
    miner::Miner,
};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub genesis: Option<genesis::Genesis>,
    pub pool: PoolConfig,
    pub tbft: TbftConfig,
    pub engine_mode: Mode,
    pub mine: bool,
    pub miner_interval: Duration,
}

impl NodeConfig {
    #[must_use]
    pub fn mainnet() -> Self {
        Self {
            chain: ChainConfig::mainnet(),
            genesis: None,
            pool: PoolConfig::default(),
            tbft: TbftConfig::default(),
            engine_mode: Mode::Normal,
            mine: false,
            miner_interval: Duration::from_secs(2),
        }
    }

    /// Network id 400: one committee seat, fake PoW, mining on.
    #[must_use]
    pub fn singlenode() -> Self {
        Self {
            chain: ChainConfig::singlenode(),
            genesis: Some(genesis::Genesis::singlenode()),
            pool: PoolConfig::default(),
            tbft: TbftConfig::default(),
            engine_mode: Mode::Fake,
            mine: true,
            miner_interval: Duration::from_millis(50),
        }
    }
}

/// The assembled node. Subsystems are owned here and reachable read-only;
/// they communicate through the handles wired at startup, never through
/// each other.
pub struct Node {
    pub database: Database,
    pub fast: Arc<FastChain>,
    pub snail: Arc<SnailChain>,
    pub election: Arc<Election>,
    pub engine: Arc<Minerva>,
    pub tx_pool: TxPool,
    pub snail_pool: SnailPool,
    pub evidence: EvidencePool,
    /// Inbound consensus gossip from the network layer.
    pub consensus_inbound: UnboundedSender<ConsensusMessage>,
    consensus_outbound: Option<UnboundedReceiver<ConsensusMessage>>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn start(config: NodeConfig, key: crypto::SecretKey) -> Result<Self> {
        let database = Database::in_memory();
        let (chain_config, fast_hash, snail_hash) =
            genesis::setup_genesis(&database, config.genesis.clone())?;
        info!("node starting (network: {}, genesis: {fast_hash})", chain_config.network_id);

        let engine = Minerva::new(chain_config, config.engine_mode);

        let verifier = Arc::new(LateBoundVerifier::default());
        let fast = FastChain::new(
            database.clone(),
            chain_config,
            Arc::clone(&verifier) as Arc<dyn fast_chain::FinalityVerifier>,
        )?;
        let snail = SnailChain::new(
            database.clone(),
            Arc::clone(&engine),
            Arc::new(FastReader(Arc::clone(&fast))),
        )?;
        debug!("chains loaded (fast: {fast_hash}, snail: {snail_hash})");

        let genesis_committee = fast
            .get_by_number(0)
            .and_then(|block| block.switch_info().map(|info| info.members.clone()))
            .ok_or_else(|| anyhow!("genesis block carries no committee"))?;
        let election = Election::new(
            chain_config,
            genesis_committee,
            Arc::new(SnailReader(Arc::clone(&snail))),
        );
        verifier.bind(Arc::clone(&election));

        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = vec![];

        let (tx_pool, tx_pool_service) = TxPool::new(
            config.pool,
            Arc::new(PoolStateReader(Arc::clone(&fast))),
        );
        tasks.push(tokio::spawn(tx_pool_service.run()));

        let (snail_pool, snail_pool_service) = SnailPool::new(
            Arc::clone(&engine),
            Arc::new(FruitPoolReader {
                fast: Arc::clone(&fast),
                snail: Arc::clone(&snail),
            }),
        );
        tasks.push(tokio::spawn(snail_pool_service.run()));

        let pending_view = PendingView::default();
        tasks.push(tokio::spawn(events_task(
            Arc::clone(&fast),
            Arc::clone(&snail),
            Arc::clone(&election),
            tx_pool.clone(),
            snail_pool.clone(),
            Arc::clone(&pending_view),
            stop_rx.clone(),
        )));

        let evidence = EvidencePool::default();
        let (consensus_outbound_tx, consensus_outbound) = unbounded();
        let (consensus_inbound, bft) = Engine::new(
            config.tbft,
            key.clone(),
            Arc::new(Committees(Arc::clone(&election))),
            Arc::new(Agent {
                fast: Arc::clone(&fast),
                election: Arc::clone(&election),
                pending: Arc::clone(&pending_view),
            }),
            Arc::new(Commit {
                fast: Arc::clone(&fast),
                election: Arc::clone(&election),
            }),
            consensus_outbound_tx,
            evidence.clone(),
        );
        tasks.push(tokio::spawn(bft.run(stop_rx.clone())));

        if config.mine {
            let miner = Miner {
                engine: Arc::clone(&engine),
                fast: Arc::clone(&fast),
                snail: Arc::clone(&snail),
                pool: snail_pool.clone(),
                coinbase: key.address(),
                public_key: key.public_key().to_uncompressed_bytes().to_vec(),
                interval: config.miner_interval,
            };
            tasks.push(tokio::spawn(miner.run(stop_rx)));
        }

        Ok(Self {
            database,
            fast,
            snail,
            election,
            engine,
            tx_pool,
            snail_pool,
            evidence,
            consensus_inbound,
            consensus_outbound: Some(consensus_outbound),
            stop,
            tasks,
        })
    }

    /// Outbound consensus gossip for the network layer. Takeable once.
    pub fn take_consensus_outbound(&mut self) -> Option<UnboundedReceiver<ConsensusMessage>> {
        self.consensus_outbound.take()
    }

    /// Our side of the protocol handshake.
    #[must_use]
    pub fn local_status(&self) -> sync::Status {
        sync::Status {
            protocol_version: sync::PROTOCOL_VERSION,
            network_id: self.fast.config().network_id,
            fast_height: self.fast.current().number(),
            fast_genesis_hash: self.fast.genesis_hash().unwrap_or_default(),
            snail_total_difficulty: self.snail.head_total_difficulty(),
            snail_head_hash: self.snail.current().hash(),
            snail_genesis_hash: self
                .snail
                .canonical_hash(0)
                .unwrap_or_default(),
        }
    }

    /// Builds the propagation stack over an externally supplied transport:
    /// a shared peer set, the announcement fetcher, and the long-range
    /// downloader, both importing into the snail chain.
    #[must_use]
    pub fn network(
        &self,
        transport: Arc<dyn sync::PeerTransport>,
    ) -> (Arc<sync::PeerSet>, sync::Fetcher, sync::Downloader) {
        let peers = Arc::new(sync::PeerSet::default());
        let sink = Arc::new(crate::handles::SnailImportSink {
            snail: Arc::clone(&self.snail),
        });

        let fetcher = sync::Fetcher::new(
            sync::FetcherConfig::default(),
            Arc::clone(&peers),
            Arc::clone(&transport),
            Arc::clone(&sink) as Arc<dyn sync::ImportSink>,
        );
        let downloader = sync::Downloader::new(
            sync::DownloaderConfig::default(),
            Arc::clone(&peers),
            transport,
            sink as Arc<dyn sync::ImportSink>,
        );

        (peers, fetcher, downloader)
    }

    pub async fn submit_transaction(&self, transaction: Transaction) -> Result<()> {
        self.tx_pool
            .add(transaction, true)
            .await
            .map_err(Into::into)
    }

    /// Signals every service and waits out a bounded drain period before
    /// aborting stragglers. Pool handles are dropped up front so the pool
    /// actors see their channels close once the other services exit.
    pub async fn shutdown(self) {
        info!("node shutting down");
        let Self {
            tx_pool,
            snail_pool,
            consensus_inbound,
            consensus_outbound,
            stop,
            tasks,
            ..
        } = self;

        let _ = stop.send(true);
        drop(tx_pool);
        drop(snail_pool);
        drop(consensus_inbound);
        drop(consensus_outbound);

        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_DRAIN, task).await.is_err() {
                warn!("task did not drain in time, aborting it");
                abort.abort();
            }
        }
    }
}

/// Forwards chain events to the pools and the election bridge and keeps
/// the pending-transaction view fresh for the proposal agent.
async fn events_task(
    fast: Arc<FastChain>,
    snail: Arc<SnailChain>,
    election: Arc<Election>,
    tx_pool: TxPool,
    snail_pool: SnailPool,
    pending_view: PendingView,
    mut stop: watch::Receiver<bool>,
) {
    let mut head_events = fast.events().subscribe_head();
    let mut new_tx_events = tx_pool.subscribe_new();
    let mut reorg_events = snail.events().subscribe_reorg();

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
            event = head_events.recv() => {
                match event {
                    Ok(event) => {
                        let block = event.block;
                        tx_pool.remove_batch(
                            block.transactions().iter().map(Transaction::hash).collect(),
                        );
                        tx_pool.on_new_head();
                        if let Some(info) = block.switch_info() {
                            election.record_switch(block.number(), info);
                        }
                        *pending_view.write() = tx_pool.pending().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("events task lagged {missed} head events");
                        tx_pool.on_new_head();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            event = new_tx_events.recv() => {
                if event.is_ok() {
                    *pending_view.write() = tx_pool.pending().await;
                }
            }
            event = reorg_events.recv() => {
                if let Ok(event) = event {
                    snail_pool.readmit(event.reverted_fruits);
                }
            }
        }
    }
}
