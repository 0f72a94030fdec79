use tokio::sync::broadcast;
use types::{Fruit, SnailBlock};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct SnailHeadEvent {
    pub block: SnailBlock,
}

/// Published when a reorg drops canonical snail blocks. The snail pool
/// re-admits the reverted fruits if they are still fresh.
#[derive(Clone, Debug)]
pub struct FruitsReorgEvent {
    pub reverted_fruits: Vec<Fruit>,
}

pub struct SnailEvents {
    head: broadcast::Sender<SnailHeadEvent>,
    reorg: broadcast::Sender<FruitsReorgEvent>,
}

impl Default for SnailEvents {
    fn default() -> Self {
        Self {
            head: broadcast::channel(EVENT_CAPACITY).0,
            reorg: broadcast::channel(EVENT_CAPACITY).0,
        }
    }
}

impl SnailEvents {
    #[must_use]
    pub fn subscribe_head(&self) -> broadcast::Receiver<SnailHeadEvent> {
        self.head.subscribe()
    }

    #[must_use]
    pub fn subscribe_reorg(&self) -> broadcast::Receiver<FruitsReorgEvent> {
        self.reorg.subscribe()
    }

    pub(crate) fn publish_head(&self, block: &SnailBlock) {
        let _ = self.head.send(SnailHeadEvent {
            block: block.clone(),
        });
    }

    pub(crate) fn publish_reorg(&self, reverted_fruits: Vec<Fruit>) {
        if !reverted_fruits.is_empty() {
            let _ = self.reorg.send(FruitsReorgEvent { reverted_fruits });
        }
    }
}
