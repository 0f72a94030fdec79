//! Node coordinator.
//!
//! Owns every subsystem and wires them together with narrow, one-way
//! capability handles; no subsystem holds a back-pointer to its owner or
//! to a sibling. Service loops run as tasks; a shutdown signal propagates
//! top-down with a bounded drain period.

pub use crate::{
    node::{Node, NodeConfig},
    miner::Miner,
};

mod handles;
mod miner;
mod node;
