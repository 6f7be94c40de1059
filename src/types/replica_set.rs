/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [ReplicaSet] type: the static membership of the cluster and the quorum
//! arithmetic derived from it.

use std::slice;

use ed25519_dalek::VerifyingKey;

use super::basic::{ReplicaId, ViewNumber};

/// Identities of the replicas in the cluster, fixed at startup.
///
/// The replica set maintains its members in ascending order of their [ids](ReplicaId), and derives
/// all quorum arithmetic from its size: a cluster of `n = 3f + 1` replicas tolerates `f` Byzantine
/// faults, becomes *prepared* on `2f` matching PREPAREs, and *committed* on `2f + 1` matching
/// COMMITs.
#[derive(Clone)]
pub struct ReplicaSet {
    // Members are kept in ascending order of replica id.
    members: Vec<(ReplicaId, VerifyingKey)>,
}

impl ReplicaSet {
    /// Create a `ReplicaSet` containing `members`. Duplicate ids are collapsed, keeping the first
    /// occurrence.
    pub fn new(mut members: Vec<(ReplicaId, VerifyingKey)>) -> ReplicaSet {
        members.sort_by_key(|(id, _)| *id);
        members.dedup_by_key(|(id, _)| *id);
        Self { members }
    }

    /// Get how many replicas are in this `ReplicaSet` (`n`).
    pub fn n(&self) -> usize {
        self.members.len()
    }

    /// Get the maximum number of Byzantine faults this `ReplicaSet` tolerates (`f = (n - 1) / 3`).
    pub fn f(&self) -> usize {
        self.n().saturating_sub(1) / 3
    }

    /// Number of matching PREPAREs required for a slot to become prepared (`2f`).
    pub fn prepare_quorum(&self) -> usize {
        2 * self.f()
    }

    /// Number of matching COMMITs (self included) required for a slot to become committed-local
    /// (`2f + 1`).
    pub fn commit_quorum(&self) -> usize {
        2 * self.f() + 1
    }

    /// Get the id of the primary of `view`, which is the member at position `view mod n`.
    pub fn primary(&self, view: ViewNumber) -> ReplicaId {
        let pos = (view.int() % self.n() as u64) as usize;
        self.members[pos].0
    }

    pub fn contains(&self, replica: &ReplicaId) -> bool {
        self.position(replica).is_some()
    }

    /// Get the verifying key registered for `replica`, if it is a member.
    pub fn verifying_key(&self, replica: &ReplicaId) -> Option<&VerifyingKey> {
        self.position(replica).map(|pos| &self.members[pos].1)
    }

    pub fn position(&self, replica: &ReplicaId) -> Option<usize> {
        self.members.binary_search_by_key(replica, |(id, _)| *id).ok()
    }

    /// Get an iterator through the members' ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.members.iter().map(|(id, _)| *id)
    }

    /// Get an iterator through the members in ascending order of their ids.
    pub fn members(&self) -> slice::Iter<(ReplicaId, VerifyingKey)> {
        self.members.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;

    fn replica_set(n: u32) -> ReplicaSet {
        let members = (0..n)
            .map(|id| {
                let key = SigningKey::from_bytes(&[id as u8; 32]);
                (ReplicaId::new(id), key.verifying_key())
            })
            .collect();
        ReplicaSet::new(members)
    }

    #[test]
    fn quorum_arithmetic() {
        let rs = replica_set(4);
        assert_eq!(rs.n(), 4);
        assert_eq!(rs.f(), 1);
        assert_eq!(rs.prepare_quorum(), 2);
        assert_eq!(rs.commit_quorum(), 3);

        let rs = replica_set(7);
        assert_eq!(rs.f(), 2);
        assert_eq!(rs.prepare_quorum(), 4);
        assert_eq!(rs.commit_quorum(), 5);
    }

    #[test]
    fn primary_rotates_with_view() {
        let rs = replica_set(4);
        assert_eq!(rs.primary(ViewNumber::new(0)), ReplicaId::new(0));
        assert_eq!(rs.primary(ViewNumber::new(1)), ReplicaId::new(1));
        assert_eq!(rs.primary(ViewNumber::new(4)), ReplicaId::new(0));
        assert_eq!(rs.primary(ViewNumber::new(6)), ReplicaId::new(2));
    }

    #[test]
    fn membership_queries() {
        let rs = replica_set(4);
        assert!(rs.contains(&ReplicaId::new(3)));
        assert!(!rs.contains(&ReplicaId::new(4)));
        assert_eq!(rs.position(&ReplicaId::new(2)), Some(2));
        assert!(rs.verifying_key(&ReplicaId::new(1)).is_some());
        assert!(rs.verifying_key(&ReplicaId::new(9)).is_none());
    }
}
