use tokio::sync::broadcast;
use types::{FastBlock, Log};

/// Capacity of each event topic. Slow subscribers lag and lose the oldest
/// events rather than blocking the chain.
const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct ChainEvent {
    pub block: FastBlock,
}

#[derive(Clone, Debug)]
pub struct ChainHeadEvent {
    pub block: FastBlock,
}

#[derive(Clone, Debug)]
pub struct LogsEvent {
    pub logs: Vec<Log>,
}

#[derive(Clone, Debug)]
pub struct RemovedLogsEvent {
    pub logs: Vec<Log>,
}

/// Per-topic broadcast channels. Events are published while the insertion
/// lock is held, so subscribers observe them in strict number order.
pub struct Events {
    chain: broadcast::Sender<ChainEvent>,
    head: broadcast::Sender<ChainHeadEvent>,
    logs: broadcast::Sender<LogsEvent>,
    removed_logs: broadcast::Sender<RemovedLogsEvent>,
}

impl Default for Events {
    fn default() -> Self {
        Self {
            chain: broadcast::channel(EVENT_CAPACITY).0,
            head: broadcast::channel(EVENT_CAPACITY).0,
            logs: broadcast::channel(EVENT_CAPACITY).0,
            removed_logs: broadcast::channel(EVENT_CAPACITY).0,
        }
    }
}

impl Events {
    #[must_use]
    pub fn subscribe_chain(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain.subscribe()
    }

    #[must_use]
    pub fn subscribe_head(&self) -> broadcast::Receiver<ChainHeadEvent> {
        self.head.subscribe()
    }

    #[must_use]
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogsEvent> {
        self.logs.subscribe()
    }

    #[must_use]
    pub fn subscribe_removed_logs(&self) -> broadcast::Receiver<RemovedLogsEvent> {
        self.removed_logs.subscribe()
    }

    pub(crate) fn publish_block(&self, block: &FastBlock, logs: Vec<Log>) {
        // A send only fails when there are no subscribers, which is fine.
        let _ = self.chain.send(ChainEvent {
            block: block.clone(),
        });
        let _ = self.head.send(ChainHeadEvent {
            block: block.clone(),
        });
        if !logs.is_empty() {
            let _ = self.logs.send(LogsEvent { logs });
        }
    }

    pub(crate) fn publish_removed_logs(&self, logs: Vec<Log>) {
        if !logs.is_empty() {
            let _ = self.removed_logs.send(RemovedLogsEvent { logs });
        }
    }
}
