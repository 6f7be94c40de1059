/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store small values, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a replica inside a cluster.
///
/// Replica ids lie in `[0, n)` where `n` is the cluster size, and are assigned by the operator at
/// startup. The set of ids is fixed for the lifetime of the cluster (static membership).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub struct ReplicaId(u32);

impl ReplicaId {
    /// Create a new `ReplicaId` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `ReplicaId`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// View number. Starts at 0 and increases by 1 every time the cluster advances past a suspected
/// primary. The primary of view `v` is the replica at position `v mod n` of the
/// [replica set](super::replica_set::ReplicaSet).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// Create a new `ViewNumber` wrapping `int`.
    pub fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the initial `ViewNumber`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u64` of this `ViewNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;

    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0.add(rhs))
    }
}

/// Position of a request in the ordered log. Assigned by the primary, strictly increasing, and
/// never reused within a view.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Create a new `SequenceNumber` wrapping `int`.
    pub fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the initial `SequenceNumber`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u64` of this `SequenceNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u64) -> Self::Output {
        SequenceNumber(self.0.add(rhs))
    }
}

impl AddAssign<u64> for SequenceNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Client-local timestamp in milliseconds. Monotonic per client; together with the
/// [`ClientId`] it identifies one logical client request for at-most-once execution.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new `Timestamp` wrapping `int`.
    pub fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` of this `Timestamp`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Name a client chooses for itself. Replicas treat it as opaque.
#[derive(Clone, PartialEq, Eq, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a new `ClientId` wrapping `string`.
    pub fn new(string: String) -> Self {
        Self(string)
    }

    /// Get a reference to the inner `str` of this `ClientId`.
    pub fn str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte cryptographic hash identifying a client request.
///
/// Within PBFT-rs, `Digest`s are always SHA256 hashes over the borsh serialization of a
/// request's client id, timestamp, and payload. Two requests are equal iff their digests match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Create a new `Digest` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `Digest`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ed25519 digital signature.
///
/// These are produced using the [`ed25519_dalek`] crate and serve as the authenticator that every
/// inter-replica message carries.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

/// Size of a message buffer (in entries).
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BufferSize(usize);

impl BufferSize {
    /// Create a new `BufferSize` wrapping `int`.
    pub const fn new(int: usize) -> Self {
        Self(int)
    }

    /// Get the inner `usize` value of this `BufferSize`.
    pub const fn int(&self) -> usize {
        self.0
    }
}
