/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! PBFT-rs is a Rust Programming Language implementation of the base case of the Practical
//! Byzantine Fault Tolerance (PBFT) consensus protocol, built as a laboratory for observing
//! safety and liveness under faults. It offers:
//! 1. The three-phase agreement protocol (PRE-PREPARE, PREPARE, COMMIT) with authenticated
//!    quorum counting, duplicate and equivocation detection, and strictly ordered execution,
//! 2. A small API ([app::App]) for plugging in arbitrary deterministic applications,
//! 3. Pluggable peer-to-peer [networking], with a ready-made [TCP transport](ipc::PeerNetwork),
//! 4. An [observer] surface through which external tools query cluster state and submit
//!    requests without touching the quorum.
//!
//! A cluster of `n = 3f + 1` replicas drives its ordered log forward as long as no more than `f`
//! of them are crashed, slow, or Byzantine. Checkpointing and the full view-change subprotocol
//! are extension points; a simplified view advance ([view_sync]) rotates the cluster away from a
//! primary that crashes or equivocates.

pub(crate) mod algorithm;

pub mod app;

pub mod config;

pub mod event_bus;

pub mod events;

pub mod ipc;

pub mod logging;

pub mod messages;

pub mod networking;

pub mod observer;

pub mod pbft;

pub mod replica;

pub mod state;

pub mod types;

pub mod view_sync;

// Re-exports
pub use app::{App, EchoApp};
pub use replica::Replica;
