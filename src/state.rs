/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory per-replica state: the message log indexed by `(view, seq)`, quorum trackers, the
//! executed-request cursor, and the client reply cache.
//!
//! [ReplicaLog] is owned by the algorithm thread and mutated solely by the
//! [protocol engine](crate::pbft::protocol). All of its insert operations are idempotent: a
//! duplicate message from the same sender for the same `(view, seq, digest)` is a no-op, so
//! quorum counts are over distinct senders by construction.
//!
//! PREPAREs and COMMITs are stored keyed by digest even before the matching PRE-PREPARE arrives.
//! This lets the log absorb out-of-order delivery without a separate pending buffer, and retains
//! the evidence needed to detect an equivocating primary: votes for a digest that conflicts with
//! the accepted PRE-PREPARE stay visible in the slot.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::pbft::messages::{ClientRequest, Reply};
use crate::types::basic::{ClientId, Digest, ReplicaId, SequenceNumber, Timestamp, ViewNumber};

/// The log entry for one `(view, seq)` position.
pub struct Slot {
    pub view: ViewNumber,
    pub seq: SequenceNumber,

    /// The accepted PRE-PREPARE, at most one per slot. A second PRE-PREPARE with a different
    /// digest is the definition of primary equivocation and is rejected by
    /// [accept_pre_prepare](ReplicaLog::accept_pre_prepare).
    pub accepted: Option<(Digest, ClientRequest)>,

    prepares: HashMap<Digest, BTreeSet<ReplicaId>>,
    commits: HashMap<Digest, BTreeSet<ReplicaId>>,

    /// Senders whose PREPARE carried a digest conflicting with the accepted PRE-PREPARE.
    /// `f + 1` distinct entries mean at least one honest replica saw a different PRE-PREPARE.
    conflicting_prepare_senders: BTreeSet<ReplicaId>,

    pub prepared: bool,
    pub committed: bool,
    pub executed: bool,
}

impl Slot {
    fn new(view: ViewNumber, seq: SequenceNumber) -> Slot {
        Slot {
            view,
            seq,
            accepted: None,
            prepares: HashMap::new(),
            commits: HashMap::new(),
            conflicting_prepare_senders: BTreeSet::new(),
            prepared: false,
            committed: false,
            executed: false,
        }
    }

    /// The digest of the accepted PRE-PREPARE, if one has been accepted.
    pub fn accepted_digest(&self) -> Option<Digest> {
        self.accepted.as_ref().map(|(digest, _)| *digest)
    }

    /// How many distinct senders have PREPAREd `digest` in this slot.
    pub fn prepare_count(&self, digest: &Digest) -> usize {
        self.prepares.get(digest).map_or(0, |senders| senders.len())
    }

    /// How many distinct senders have COMMITted `digest` in this slot.
    pub fn commit_count(&self, digest: &Digest) -> usize {
        self.commits.get(digest).map_or(0, |senders| senders.len())
    }

    /// How many distinct senders have PREPAREd a digest conflicting with the accepted one.
    pub fn conflicting_prepares(&self) -> usize {
        self.conflicting_prepare_senders.len()
    }
}

/// The ways a [ReplicaLog] operation can fail.
#[derive(Debug)]
pub enum StateError {
    /// The primary proposed two different digests for the same `(view, seq)`.
    Equivocation {
        view: ViewNumber,
        seq: SequenceNumber,
        accepted: Digest,
        received: Digest,
    },
    /// An execution was attempted out of ascending contiguous order. This is a programming
    /// error, not a protocol condition: callers terminate the process on seeing it.
    OutOfOrderExecute {
        seq: SequenceNumber,
        expected: SequenceNumber,
    },
    /// A mutation was attempted under a view other than the log's current view. Surfaced to the
    /// caller, which decides whether to drop or buffer.
    UnknownView {
        view: ViewNumber,
        current: ViewNumber,
    },
}

/// In-memory store of one replica's protocol state. Created empty at startup (`view = 0`,
/// `seq_cursor = 0`), mutated only from the algorithm thread, discarded on shutdown.
pub struct ReplicaLog {
    view: ViewNumber,
    seq_cursor: SequenceNumber,
    slots: BTreeMap<(ViewNumber, SequenceNumber), Slot>,
    last_executed: Option<SequenceNumber>,
    reply_cache: HashMap<(ClientId, Timestamp), Reply>,
    auth_rejections: u64,
}

impl ReplicaLog {
    pub fn new() -> ReplicaLog {
        ReplicaLog {
            view: ViewNumber::init(),
            seq_cursor: SequenceNumber::init(),
            slots: BTreeMap::new(),
            last_executed: None,
            reply_cache: HashMap::new(),
            auth_rejections: 0,
        }
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    /// Move to `view`. The sequence cursor resumes at the next unexecuted sequence number;
    /// in-flight slots of earlier views are abandoned (a full view change would instead carry
    /// their prepared certificates over).
    pub(crate) fn enter_view(&mut self, view: ViewNumber) {
        self.view = view;
        self.seq_cursor = self.next_unexecuted();
    }

    /// Allocate the next sequence number. Only the primary of the current view calls this.
    pub(crate) fn assign_seq(&mut self) -> SequenceNumber {
        let seq = self.seq_cursor;
        self.seq_cursor += 1;
        seq
    }

    pub fn seq_cursor(&self) -> SequenceNumber {
        self.seq_cursor
    }

    /// Store a PRE-PREPARE for `(view, seq)`. At most one digest is ever accepted per slot; a
    /// conflicting digest raises [StateError::Equivocation] and leaves the accepted one in place.
    pub fn accept_pre_prepare(
        &mut self,
        view: ViewNumber,
        seq: SequenceNumber,
        digest: Digest,
        request: ClientRequest,
    ) -> Result<(), StateError> {
        if view != self.view {
            return Err(StateError::UnknownView {
                view,
                current: self.view,
            });
        }

        let slot = self
            .slots
            .entry((view, seq))
            .or_insert_with(|| Slot::new(view, seq));

        match slot.accepted_digest() {
            Some(accepted) if accepted != digest => Err(StateError::Equivocation {
                view,
                seq,
                accepted,
                received: digest,
            }),
            Some(_) => Ok(()),
            None => {
                slot.accepted = Some((digest, request));
                // The primary proposing beyond the cursor must not make the cursor reuse seqs.
                if seq >= self.seq_cursor {
                    self.seq_cursor = seq + 1;
                }
                Ok(())
            }
        }
    }

    /// Record a PREPARE from `sender` for `(view, seq, digest)`. Idempotent per sender. Returns
    /// the count of distinct senders that have PREPAREd this digest.
    pub fn add_prepare(
        &mut self,
        sender: ReplicaId,
        view: ViewNumber,
        seq: SequenceNumber,
        digest: Digest,
    ) -> Result<usize, StateError> {
        if view != self.view {
            return Err(StateError::UnknownView {
                view,
                current: self.view,
            });
        }

        let slot = self
            .slots
            .entry((view, seq))
            .or_insert_with(|| Slot::new(view, seq));
        let senders = slot.prepares.entry(digest).or_insert_with(BTreeSet::new);
        senders.insert(sender);
        Ok(senders.len())
    }

    /// Record a COMMIT from `sender` for `(view, seq, digest)`. Idempotent per sender. Returns
    /// the count of distinct senders that have COMMITted this digest.
    pub fn add_commit(
        &mut self,
        sender: ReplicaId,
        view: ViewNumber,
        seq: SequenceNumber,
        digest: Digest,
    ) -> Result<usize, StateError> {
        if view != self.view {
            return Err(StateError::UnknownView {
                view,
                current: self.view,
            });
        }

        let slot = self
            .slots
            .entry((view, seq))
            .or_insert_with(|| Slot::new(view, seq));
        let senders = slot.commits.entry(digest).or_insert_with(BTreeSet::new);
        senders.insert(sender);
        Ok(senders.len())
    }

    /// Record that `sender` PREPAREd a digest conflicting with the slot's accepted PRE-PREPARE.
    /// Returns the count of distinct conflicting senders.
    pub(crate) fn note_conflicting_prepare(
        &mut self,
        sender: ReplicaId,
        view: ViewNumber,
        seq: SequenceNumber,
    ) -> usize {
        let slot = self
            .slots
            .entry((view, seq))
            .or_insert_with(|| Slot::new(view, seq));
        slot.conflicting_prepare_senders.insert(sender);
        slot.conflicting_prepare_senders.len()
    }

    pub fn slot(&self, view: ViewNumber, seq: SequenceNumber) -> Option<&Slot> {
        self.slots.get(&(view, seq))
    }

    /// Mark the slot at `(view, seq)` prepared. Monotonic.
    pub(crate) fn set_prepared(&mut self, view: ViewNumber, seq: SequenceNumber) {
        if let Some(slot) = self.slots.get_mut(&(view, seq)) {
            slot.prepared = true;
        }
    }

    /// Mark the slot at `(view, seq)` committed-local. Monotonic.
    pub(crate) fn set_committed(&mut self, view: ViewNumber, seq: SequenceNumber) {
        if let Some(slot) = self.slots.get_mut(&(view, seq)) {
            slot.committed = true;
        }
    }

    /// The sequence number the next execution must have: executed seqs always form the prefix
    /// `[0, last_executed]`.
    pub fn next_unexecuted(&self) -> SequenceNumber {
        match self.last_executed {
            Some(seq) => seq + 1,
            None => SequenceNumber::init(),
        }
    }

    pub fn last_executed(&self) -> Option<SequenceNumber> {
        self.last_executed
    }

    /// Find the committed, unexecuted slot whose seq is exactly the next unexecuted one, if any.
    pub fn next_executable(&self) -> Option<(ViewNumber, SequenceNumber)> {
        let next = self.next_unexecuted();
        self.slots
            .values()
            .find(|slot| slot.seq == next && slot.committed && !slot.executed)
            .map(|slot| (slot.view, slot.seq))
    }

    /// Flag the slot at `(view, seq)` as executed.
    ///
    /// # Precondition
    ///
    /// `seq` is exactly the next unexecuted sequence number. Execution must never skip a
    /// sequence number; a violation is [StateError::OutOfOrderExecute].
    pub fn mark_executed(
        &mut self,
        view: ViewNumber,
        seq: SequenceNumber,
    ) -> Result<(), StateError> {
        let expected = self.next_unexecuted();
        if seq != expected {
            return Err(StateError::OutOfOrderExecute { seq, expected });
        }
        if let Some(slot) = self.slots.get_mut(&(view, seq)) {
            slot.executed = true;
        }
        self.last_executed = Some(seq);
        Ok(())
    }

    /// Look up the most recent reply produced for `(client, timestamp)`. A hit means the request
    /// was executed before: the caller re-sends the cached reply instead of re-executing.
    pub fn cached_reply(&self, client: &ClientId, timestamp: Timestamp) -> Option<&Reply> {
        self.reply_cache.get(&(client.clone(), timestamp))
    }

    /// Whether `(client, timestamp)` is already ordered at an unexecuted slot. Guards the primary
    /// against assigning a second sequence number to a request whose first copy has not produced
    /// a cached reply yet.
    pub fn in_flight(&self, client: &ClientId, timestamp: Timestamp) -> bool {
        self.slots.values().any(|slot| {
            !slot.executed
                && slot.accepted.as_ref().map_or(false, |(_, request)| {
                    request.client == *client && request.timestamp == timestamp
                })
        })
    }

    pub(crate) fn cache_reply(&mut self, reply: Reply) {
        self.reply_cache
            .insert((reply.client.clone(), reply.timestamp), reply);
    }

    /// How many slots are currently in at least the prepared phase.
    pub fn prepared_slots(&self) -> u64 {
        self.slots.values().filter(|slot| slot.prepared).count() as u64
    }

    /// How many slots are currently in at least the committed-local phase.
    pub fn committed_slots(&self) -> u64 {
        self.slots.values().filter(|slot| slot.committed).count() as u64
    }

    /// Whether any slot of the current view has been proposed but not yet executed. Used by the
    /// progress timer to distinguish a stalled cluster from an idle one.
    pub fn has_stalled_slots(&self) -> bool {
        self.slots
            .values()
            .any(|slot| slot.view == self.view && slot.accepted.is_some() && !slot.executed)
    }

    pub(crate) fn note_auth_rejection(&mut self) {
        self.auth_rejections += 1;
    }

    pub fn auth_rejections(&self) -> u64 {
        self.auth_rejections
    }
}

impl Default for ReplicaLog {
    fn default() -> Self {
        ReplicaLog::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(payload: &[u8]) -> ClientRequest {
        ClientRequest::new(
            ClientId::new("c1".to_string()),
            Timestamp::new(1),
            payload.to_vec(),
        )
    }

    fn v(int: u64) -> ViewNumber {
        ViewNumber::new(int)
    }

    fn s(int: u64) -> SequenceNumber {
        SequenceNumber::new(int)
    }

    fn r(int: u32) -> ReplicaId {
        ReplicaId::new(int)
    }

    #[test]
    fn accept_pre_prepare_rejects_conflicting_digest() {
        let mut log = ReplicaLog::new();
        let m1 = request(b"a");
        let m2 = request(b"b");

        log.accept_pre_prepare(v(0), s(0), m1.digest(), m1.clone())
            .unwrap();

        // Same digest again is an idempotent no-op.
        log.accept_pre_prepare(v(0), s(0), m1.digest(), m1.clone())
            .unwrap();

        // A different digest at the same (view, seq) is equivocation; the accepted digest stays.
        match log.accept_pre_prepare(v(0), s(0), m2.digest(), m2) {
            Err(StateError::Equivocation { accepted, .. }) => assert_eq!(accepted, m1.digest()),
            other => panic!("expected Equivocation, got {:?}", other.map(|_| ())),
        }
        assert_eq!(
            log.slot(v(0), s(0)).unwrap().accepted_digest(),
            Some(m1.digest())
        );
    }

    #[test]
    fn accept_pre_prepare_checks_the_view() {
        let mut log = ReplicaLog::new();
        let m = request(b"a");
        assert!(matches!(
            log.accept_pre_prepare(v(3), s(0), m.digest(), m),
            Err(StateError::UnknownView { .. })
        ));
    }

    #[test]
    fn duplicate_votes_do_not_change_quorum_counts() {
        let mut log = ReplicaLog::new();
        let digest = request(b"a").digest();

        assert_eq!(log.add_prepare(r(1), v(0), s(0), digest).unwrap(), 1);
        assert_eq!(log.add_prepare(r(1), v(0), s(0), digest).unwrap(), 1);
        assert_eq!(log.add_prepare(r(2), v(0), s(0), digest).unwrap(), 2);

        assert_eq!(log.add_commit(r(1), v(0), s(0), digest).unwrap(), 1);
        assert_eq!(log.add_commit(r(1), v(0), s(0), digest).unwrap(), 1);
    }

    #[test]
    fn votes_for_different_digests_are_tracked_separately() {
        let mut log = ReplicaLog::new();
        let d1 = request(b"a").digest();
        let d2 = request(b"b").digest();

        log.add_prepare(r(1), v(0), s(0), d1).unwrap();
        log.add_prepare(r(2), v(0), s(0), d2).unwrap();

        let slot = log.slot(v(0), s(0)).unwrap();
        assert_eq!(slot.prepare_count(&d1), 1);
        assert_eq!(slot.prepare_count(&d2), 1);
    }

    #[test]
    fn votes_survive_arriving_before_the_pre_prepare() {
        let mut log = ReplicaLog::new();
        let m = request(b"a");
        let digest = m.digest();

        // COMMITs and PREPAREs arrive first.
        log.add_commit(r(1), v(0), s(0), digest).unwrap();
        log.add_commit(r(2), v(0), s(0), digest).unwrap();
        log.add_prepare(r(1), v(0), s(0), digest).unwrap();

        // The PRE-PREPARE lands afterwards; the earlier votes are still counted.
        log.accept_pre_prepare(v(0), s(0), digest, m).unwrap();
        let slot = log.slot(v(0), s(0)).unwrap();
        assert_eq!(slot.prepare_count(&digest), 1);
        assert_eq!(slot.commit_count(&digest), 2);
    }

    #[test]
    fn execution_is_contiguous_from_zero() {
        let mut log = ReplicaLog::new();
        let m = request(b"a");
        log.accept_pre_prepare(v(0), s(0), m.digest(), m.clone())
            .unwrap();
        log.accept_pre_prepare(v(0), s(1), m.digest(), m).unwrap();
        log.set_committed(v(0), s(0));
        log.set_committed(v(0), s(1));

        // seq 1 cannot execute before seq 0.
        assert!(matches!(
            log.mark_executed(v(0), s(1)),
            Err(StateError::OutOfOrderExecute { .. })
        ));

        assert_eq!(log.next_executable(), Some((v(0), s(0))));
        log.mark_executed(v(0), s(0)).unwrap();
        assert_eq!(log.last_executed(), Some(s(0)));
        assert_eq!(log.next_executable(), Some((v(0), s(1))));
        log.mark_executed(v(0), s(1)).unwrap();
        assert_eq!(log.last_executed(), Some(s(1)));
        assert_eq!(log.next_executable(), None);
    }

    #[test]
    fn assign_seq_is_strictly_increasing() {
        let mut log = ReplicaLog::new();
        assert_eq!(log.assign_seq(), s(0));
        assert_eq!(log.assign_seq(), s(1));
        assert_eq!(log.assign_seq(), s(2));
    }

    #[test]
    fn accepting_a_pre_prepare_advances_the_cursor_past_it() {
        let mut log = ReplicaLog::new();
        let m = request(b"a");
        log.accept_pre_prepare(v(0), s(4), m.digest(), m).unwrap();
        assert_eq!(log.seq_cursor(), s(5));
    }

    #[test]
    fn entering_a_view_resumes_the_cursor_at_the_next_unexecuted_seq() {
        let mut log = ReplicaLog::new();
        let m = request(b"a");
        log.accept_pre_prepare(v(0), s(0), m.digest(), m.clone())
            .unwrap();
        log.accept_pre_prepare(v(0), s(1), m.digest(), m).unwrap();
        log.set_committed(v(0), s(0));
        log.mark_executed(v(0), s(0)).unwrap();

        log.enter_view(v(1));
        assert_eq!(log.view(), v(1));
        assert_eq!(log.seq_cursor(), s(1));
    }

    #[test]
    fn reply_cache_hits_by_client_and_timestamp() {
        use crate::types::keypair::Keypair;
        use ed25519_dalek::SigningKey;

        let mut log = ReplicaLog::new();
        let keypair = Keypair::new(SigningKey::from_bytes(&[7; 32]));
        let client = ClientId::new("c1".to_string());
        let reply = Reply::new(
            &keypair,
            r(0),
            v(0),
            s(0),
            client.clone(),
            Timestamp::new(1),
            b"hello".to_vec(),
        );

        assert!(log.cached_reply(&client, Timestamp::new(1)).is_none());
        log.cache_reply(reply);
        assert!(log.cached_reply(&client, Timestamp::new(1)).is_some());
        assert!(log.cached_reply(&client, Timestamp::new(2)).is_none());
    }

    #[test]
    fn stalled_slot_detection_tracks_the_current_view() {
        let mut log = ReplicaLog::new();
        assert!(!log.has_stalled_slots());

        let m = request(b"a");
        log.accept_pre_prepare(v(0), s(0), m.digest(), m).unwrap();
        assert!(log.has_stalled_slots());

        // Slots of an abandoned view no longer count as stalled.
        log.enter_view(v(1));
        assert!(!log.has_stalled_slots());
    }
}
