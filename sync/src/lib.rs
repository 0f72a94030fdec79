//! Block and transaction propagation.
//!
//! Two regimes share the peer set: the [`Downloader`] performs long-range
//! skeleton synchronization of the snail chain against the best peer, and
//! the [`Fetcher`] handles steady-state block announcements with per-peer
//! DoS accounting. The wire transport is an external collaborator; both
//! sides talk to it through [`PeerTransport`].

pub use crate::{
    downloader::{Downloader, DownloaderConfig, RequestId, SyncStatus},
    fetcher::{Fetcher, FetcherConfig, ImportOutcome, ImportSink},
    handshake::{verify_status, HandshakeError},
    messages::{Message, Status, PROTOCOL_VERSION},
    peers::{PeerId, PeerInfo, PeerSet, PeerState, PeerTransport},
};

mod downloader;
mod fetcher;
mod handshake;
mod messages;
mod peers;
