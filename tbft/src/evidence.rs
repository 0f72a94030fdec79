use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::messages::Vote;

/// Two votes by the same signer for different values in the same
/// `(height, round, kind)`.
#[derive(Clone, Debug)]
pub struct DoubleSignEvidence {
    pub first: Vote,
    pub second: Vote,
}

/// Collected equivocation evidence. There is no on-chain penalty yet; the
/// pool exists so one can be added without touching the engine.
#[derive(Clone, Default)]
pub struct EvidencePool {
    evidence: Arc<Mutex<Vec<DoubleSignEvidence>>>,
}

impl EvidencePool {
    pub fn record(&self, evidence: DoubleSignEvidence) {
        warn!(
            "double sign detected (height: {}, round: {}, kind: {:?})",
            evidence.first.height, evidence.first.round, evidence.first.kind,
        );
        self.evidence.lock().push(evidence);
    }

    #[must_use]
    pub fn all(&self) -> Vec<DoubleSignEvidence> {
        self.evidence.lock().clone()
    }
}
