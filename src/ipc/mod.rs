/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! TCP transport between replicas, and the socket multiplexing that lets observer tools share
//! the replica's single listening port.
//!
//! Every inbound connection announces itself with a one-byte tag: [PEER_CONNECTION_TAG]
//! followed by the initiating replica's id for inter-replica streams, or
//! [OBSERVER_CONNECTION_TAG] for [observer](crate::observer) connections.

pub(crate) mod establisher;

pub(crate) mod manager;

pub(crate) mod stream;

pub use manager::PeerNetwork;

/// First byte of an inter-replica connection, followed by the initiator's id as a `u32` LE.
pub(crate) const PEER_CONNECTION_TAG: u8 = b'P';

/// First byte of an observer connection.
pub(crate) const OBSERVER_CONNECTION_TAG: u8 = b'O';
