use thiserror::Error;
use types::{NetworkId, H256};

use crate::messages::{Status, PROTOCOL_VERSION};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum HandshakeError {
    #[error("protocol version mismatch (local: {local}, remote: {remote})")]
    ProtocolVersion { local: u32, remote: u32 },
    #[error("network id mismatch (local: {local}, remote: {remote})")]
    NetworkId { local: NetworkId, remote: NetworkId },
    #[error("fast genesis mismatch (local: {local}, remote: {remote})")]
    FastGenesis { local: H256, remote: H256 },
    #[error("snail genesis mismatch (local: {local}, remote: {remote})")]
    SnailGenesis { local: H256, remote: H256 },
}

/// Validates a remote `Status` against ours. Any mismatch is fatal for the
/// channel: the caller disconnects without mutating chain state.
pub fn verify_status(local: &Status, remote: &Status) -> Result<(), HandshakeError> {
    if remote.protocol_version != PROTOCOL_VERSION {
        return Err(HandshakeError::ProtocolVersion {
            local: PROTOCOL_VERSION,
            remote: remote.protocol_version,
        });
    }

    if remote.network_id != local.network_id {
        return Err(HandshakeError::NetworkId {
            local: local.network_id,
            remote: remote.network_id,
        });
    }

    if remote.fast_genesis_hash != local.fast_genesis_hash {
        return Err(HandshakeError::FastGenesis {
            local: local.fast_genesis_hash,
            remote: remote.fast_genesis_hash,
        });
    }

    if remote.snail_genesis_hash != local.snail_genesis_hash {
        return Err(HandshakeError::SnailGenesis {
            local: local.snail_genesis_hash,
            remote: remote.snail_genesis_hash,
        });
    }

    Ok(())
}
