/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the three-phase agreement protocol.
//!
//! Main type: [`Pbft`].

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::app::App;
use crate::events::{
    CommitEvent, CommittedEvent, EquivocationEvent, Event, ExecuteEvent, ForwardRequestEvent,
    PrePrepareEvent, PrepareEvent, PreparedEvent, ReceiveCommitEvent, ReceivePrePrepareEvent,
    ReceivePrepareEvent, ReceiveRequestEvent,
};
use crate::networking::{ClientGateway, Network, SenderHandle};
use crate::pbft::messages::{
    ClientRequest, Commit, Forward, PbftMessage, PrePrepare, Prepare, Reply,
};
use crate::pbft::roles::is_primary;
use crate::state::{ReplicaLog, StateError};
use crate::types::{
    basic::{ReplicaId, SequenceNumber, ViewNumber},
    keypair::Keypair,
    replica_set::ReplicaSet,
};

/// A single participant in the three-phase agreement protocol.
///
/// # Usage
///
/// The `Pbft` struct is meant to be used in an "event-oriented" fashion: its crate-public
/// methods are event handlers called by the [algorithm](crate::algorithm) thread when specific
/// things happen to the replica:
/// 1. [`on_client_request`](Self::on_client_request): called when a client request arrives
///    through the observer surface.
/// 2. [`on_receive_msg`](Self::on_receive_msg): called when a verified [`PbftMessage`] is
///    received from a peer.
/// 3. [`execute_ready`](Self::execute_ready): called after every event to apply committed slots
///    to the application in ascending contiguous sequence order.
///
/// `Pbft` does not own the [`ReplicaLog`]; the algorithm thread passes it in by mutable
/// reference, keeping all state mutation on one serialization point.
pub(crate) struct Pbft<N: Network, G: ClientGateway> {
    config: PbftConfiguration,
    replica_set: ReplicaSet,
    sender_handle: SenderHandle<N>,
    gateway: G,
    event_publisher: Option<Sender<Event>>,
}

/// Configuration parameters for the [`Pbft`] struct.
#[derive(Clone)]
pub(crate) struct PbftConfiguration {
    /// The id of the local replica.
    pub(crate) me: ReplicaId,

    /// The keypair with which the protocol signs its outbound messages.
    pub(crate) keypair: Keypair,

    /// Optional watermark span: when set, PRE-PREPAREs whose sequence number lies outside
    /// `[next_unexecuted, next_unexecuted + seq_window)` are dropped.
    pub(crate) seq_window: Option<u64>,
}

/// What intake decided about a submitted client request. Returned to the observer surface.
#[derive(Clone, Copy)]
pub struct Intake {
    pub accepted: bool,
    pub forwarded_to: Option<ReplicaId>,
}

/// What processing one message did to the replica's state. The algorithm thread uses `progress`
/// to reset the progress timer, and `suspect_primary` to trigger the simplified view advance.
pub(crate) struct Outcome {
    pub(crate) progress: bool,
    pub(crate) suspect_primary: Option<String>,
}

impl Outcome {
    fn none() -> Outcome {
        Outcome {
            progress: false,
            suspect_primary: None,
        }
    }

    fn progress() -> Outcome {
        Outcome {
            progress: true,
            suspect_primary: None,
        }
    }

    fn suspect(reason: String) -> Outcome {
        Outcome {
            progress: false,
            suspect_primary: Some(reason),
        }
    }
}

/// The different ways a call to a method of the `Pbft` struct can fail. All variants are
/// internal invariant violations: the algorithm thread reports them and terminates the process
/// with exit code 3.
#[derive(Debug)]
pub enum PbftError {
    StateError(StateError),
    CommittedSlotWithoutRequest {
        view: ViewNumber,
        seq: SequenceNumber,
    },
}

impl From<StateError> for PbftError {
    fn from(value: StateError) -> Self {
        PbftError::StateError(value)
    }
}

impl<N: Network, G: ClientGateway> Pbft<N, G> {
    /// Create a new three-phase agreement participant.
    pub(crate) fn new(
        config: PbftConfiguration,
        replica_set: ReplicaSet,
        sender_handle: SenderHandle<N>,
        gateway: G,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            config,
            replica_set,
            sender_handle,
            gateway,
            event_publisher,
        }
    }

    /// Process a client request arriving at this replica, directly or by forwarding.
    ///
    /// ## Internal procedure
    ///
    /// 1. If a cached reply exists for `(client, timestamp)`, re-send it and stop: the request
    ///    was executed before and must not execute again.
    /// 2. If this replica is a backup of the current view, relay the request to the primary,
    ///    unless the request was already forwarded once (no forwarding loops).
    /// 3. If this replica is the primary, allocate the next sequence number, feed the
    ///    PRE-PREPARE into the local log, and broadcast it to the backups.
    pub(crate) fn on_client_request(
        &mut self,
        request: ClientRequest,
        log: &mut ReplicaLog,
    ) -> Intake {
        Event::ReceiveRequest(ReceiveRequestEvent {
            timestamp: SystemTime::now(),
            request: request.clone(),
        })
        .publish(&self.event_publisher);

        // 1. Re-send the cached reply if this request was executed before; swallow the duplicate
        // if it is already ordered but not yet executed.
        if let Some(reply) = log.cached_reply(&request.client, request.timestamp) {
            self.gateway.send_reply(reply.clone());
            return Intake {
                accepted: true,
                forwarded_to: None,
            };
        }
        if log.in_flight(&request.client, request.timestamp) {
            return Intake {
                accepted: true,
                forwarded_to: None,
            };
        }

        let view = log.view();
        let primary = self.replica_set.primary(view);

        // 2. Backups forward to the primary, exactly once.
        if !is_primary(&self.config.me, view, &self.replica_set) {
            if request.forwarded {
                log::debug!(
                    "replica {} dropping already-forwarded request from client {}",
                    self.config.me,
                    request.client
                );
                return Intake {
                    accepted: false,
                    forwarded_to: None,
                };
            }

            let forward = Forward::new(&self.config.keypair, self.config.me, request.clone());
            self.sender_handle.send(primary, forward);

            Event::ForwardRequest(ForwardRequestEvent {
                timestamp: SystemTime::now(),
                primary,
                request,
            })
            .publish(&self.event_publisher);

            return Intake {
                accepted: true,
                forwarded_to: Some(primary),
            };
        }

        // 3. The primary orders the request and announces the ordering.
        let seq = log.assign_seq();
        let pre_prepare = PrePrepare::new(&self.config.keypair, self.config.me, view, seq, request);

        if let Err(err) = log.accept_pre_prepare(
            view,
            seq,
            pre_prepare.digest,
            pre_prepare.request.clone(),
        ) {
            // A freshly assigned seq can never conflict with an accepted digest.
            log::error!(
                "replica {} could not store its own PRE-PREPARE at ({}, {}): {:?}",
                self.config.me,
                view,
                seq,
                err
            );
            return Intake {
                accepted: false,
                forwarded_to: None,
            };
        }

        self.sender_handle.broadcast(pre_prepare.clone());

        Event::PrePrepare(PrePrepareEvent {
            timestamp: SystemTime::now(),
            pre_prepare,
        })
        .publish(&self.event_publisher);

        Intake {
            accepted: true,
            forwarded_to: None,
        }
    }

    /// Process a newly received, signature-verified message for the current view.
    pub(crate) fn on_receive_msg(
        &mut self,
        msg: PbftMessage,
        origin: ReplicaId,
        log: &mut ReplicaLog,
    ) -> Result<Outcome, PbftError> {
        match msg {
            PbftMessage::PrePrepare(pre_prepare) => {
                Ok(self.on_receive_pre_prepare(pre_prepare, origin, log))
            }
            PbftMessage::Prepare(prepare) => Ok(self.on_receive_prepare(prepare, origin, log)),
            PbftMessage::Commit(commit) => self.on_receive_commit(commit, origin, log),
            PbftMessage::Forward(forward) => Ok(self.on_receive_forward(forward, origin, log)),
        }
    }

    /// Process a received `pre_prepare`.
    ///
    /// ## Internal procedure
    ///
    /// 1. Check that the sender is the primary of the current view, that the digest matches the
    ///    carried request, and that the sequence number lies within the watermark window. On any
    ///    failure, drop the message.
    /// 2. Store the PRE-PREPARE. A conflicting digest at the same `(view, seq)` is equivocation:
    ///    the second PRE-PREPARE is rejected, the evidence is published, and the primary becomes
    ///    suspect.
    /// 3. Backups endorse the ordering by broadcasting a PREPARE and recording their own vote.
    fn on_receive_pre_prepare(
        &mut self,
        pre_prepare: PrePrepare,
        origin: ReplicaId,
        log: &mut ReplicaLog,
    ) -> Outcome {
        let view = log.view();

        // 1. Only the primary of the current view may order requests.
        if pre_prepare.view != view || !is_primary(&origin, view, &self.replica_set) {
            return Outcome::none();
        }

        if pre_prepare.digest != pre_prepare.request.digest() {
            log::warn!(
                "replica {} dropping PRE-PREPARE at ({}, {}): digest does not match request",
                self.config.me,
                view,
                pre_prepare.seq
            );
            log.note_auth_rejection();
            return Outcome::none();
        }

        if let Some(window) = self.config.seq_window {
            let low = log.next_unexecuted();
            if pre_prepare.seq < low || pre_prepare.seq.int() >= low.int() + window {
                log::debug!(
                    "replica {} dropping PRE-PREPARE at ({}, {}): outside watermark window",
                    self.config.me,
                    view,
                    pre_prepare.seq
                );
                return Outcome::none();
            }
        }

        // 2. Store it. A second digest at the same slot is primary equivocation; the same digest
        // again is an idempotent duplicate.
        let seq = pre_prepare.seq;
        let digest = pre_prepare.digest;
        let already_accepted = log
            .slot(view, seq)
            .and_then(|slot| slot.accepted_digest())
            .is_some();
        match log.accept_pre_prepare(view, seq, digest, pre_prepare.request.clone()) {
            Ok(()) => (),
            Err(StateError::Equivocation { accepted, received, .. }) => {
                Event::Equivocation(EquivocationEvent {
                    timestamp: SystemTime::now(),
                    view,
                    seq,
                    accepted,
                    conflicting: Some(received),
                })
                .publish(&self.event_publisher);
                return Outcome::suspect(format!(
                    "primary {} equivocated at ({}, {})",
                    origin, view, seq
                ));
            }
            Err(_) => return Outcome::none(),
        }

        if already_accepted {
            return Outcome::none();
        }

        Event::ReceivePrePrepare(ReceivePrePrepareEvent {
            timestamp: SystemTime::now(),
            origin,
            pre_prepare,
        })
        .publish(&self.event_publisher);

        // 3. Backups broadcast a PREPARE and count their own vote. The primary does not emit
        // PREPAREs: its PRE-PREPARE already binds it to the digest, and the prepare quorum is
        // counted over the 2f backups endorsing it.
        if !is_primary(&self.config.me, view, &self.replica_set) {
            let prepare = Prepare::new(&self.config.keypair, self.config.me, view, seq, digest);
            self.sender_handle.broadcast(prepare.clone());

            Event::Prepare(PrepareEvent {
                timestamp: SystemTime::now(),
                prepare,
            })
            .publish(&self.event_publisher);

            let _ = log.add_prepare(self.config.me, view, seq, digest);
        }

        self.try_advance(view, seq, log);
        Outcome::progress()
    }

    /// Process a received `prepare`.
    ///
    /// A PREPARE whose digest conflicts with the accepted PRE-PREPARE is evidence that the
    /// sender saw a different PRE-PREPARE for this slot. `f + 1` distinct conflicting senders
    /// guarantee at least one of them is honest, which convicts the primary.
    fn on_receive_prepare(
        &mut self,
        prepare: Prepare,
        origin: ReplicaId,
        log: &mut ReplicaLog,
    ) -> Outcome {
        let view = log.view();
        if prepare.view != view {
            return Outcome::none();
        }

        Event::ReceivePrepare(ReceivePrepareEvent {
            timestamp: SystemTime::now(),
            origin,
            prepare: prepare.clone(),
        })
        .publish(&self.event_publisher);

        let seq = prepare.seq;
        let accepted = log.slot(view, seq).and_then(|slot| slot.accepted_digest());

        if let Some(accepted) = accepted {
            if accepted != prepare.digest {
                let conflicts = log.note_conflicting_prepare(origin, view, seq);
                if conflicts >= self.replica_set.f() + 1 {
                    Event::Equivocation(EquivocationEvent {
                        timestamp: SystemTime::now(),
                        view,
                        seq,
                        accepted,
                        conflicting: Some(prepare.digest),
                    })
                    .publish(&self.event_publisher);
                    return Outcome::suspect(format!(
                        "{} conflicting PREPAREs at ({}, {})",
                        conflicts, view, seq
                    ));
                }
                return Outcome::none();
            }
        }

        let _ = log.add_prepare(origin, view, seq, prepare.digest);
        self.try_advance(view, seq, log);
        Outcome::progress()
    }

    /// Process a received `commit`.
    ///
    /// COMMITs may arrive before the local prepare quorum completes, or even before the
    /// PRE-PREPARE; they are stored and count toward the commit quorum once `prepared` holds.
    fn on_receive_commit(
        &mut self,
        commit: Commit,
        origin: ReplicaId,
        log: &mut ReplicaLog,
    ) -> Result<Outcome, PbftError> {
        let view = log.view();
        if commit.view != view {
            return Ok(Outcome::none());
        }

        Event::ReceiveCommit(ReceiveCommitEvent {
            timestamp: SystemTime::now(),
            origin,
            commit: commit.clone(),
        })
        .publish(&self.event_publisher);

        let seq = commit.seq;
        let accepted = log.slot(view, seq).and_then(|slot| slot.accepted_digest());
        if let Some(accepted) = accepted {
            if accepted != commit.digest {
                log::debug!(
                    "replica {} dropping COMMIT from {} at ({}, {}): digest mismatch",
                    self.config.me,
                    origin,
                    view,
                    seq
                );
                return Ok(Outcome::none());
            }
        }

        let _ = log.add_commit(origin, view, seq, commit.digest);
        self.try_advance(view, seq, log);
        Ok(Outcome::progress())
    }

    /// Process a request relayed by a backup. Only meaningful at the primary; everywhere else
    /// the forwarded flag stops the relay chain.
    fn on_receive_forward(
        &mut self,
        forward: Forward,
        origin: ReplicaId,
        log: &mut ReplicaLog,
    ) -> Outcome {
        if !is_primary(&self.config.me, log.view(), &self.replica_set) {
            log::debug!(
                "replica {} dropping forwarded request from {}: not the primary",
                self.config.me,
                origin
            );
            return Outcome::none();
        }

        let intake = self.on_client_request(forward.request, log);
        if intake.accepted {
            Outcome::progress()
        } else {
            Outcome::none()
        }
    }

    /// Drive the slot at `(view, seq)` through the `prepared` and `committed_local` transitions
    /// if its quorums are satisfied. Transitions are monotonic; each fires at most once.
    fn try_advance(&mut self, view: ViewNumber, seq: SequenceNumber, log: &mut ReplicaLog) {
        let (digest, prepares, prepared) = match log.slot(view, seq) {
            Some(slot) => match slot.accepted_digest() {
                Some(digest) => (digest, slot.prepare_count(&digest), slot.prepared),
                None => return,
            },
            None => return,
        };

        if !prepared && prepares >= self.replica_set.prepare_quorum() {
            log.set_prepared(view, seq);

            Event::Prepared(PreparedEvent {
                timestamp: SystemTime::now(),
                view,
                seq,
                digest,
                prepares,
            })
            .publish(&self.event_publisher);

            // Once prepared, announce the intent to execute and count our own COMMIT.
            let commit = Commit::new(&self.config.keypair, self.config.me, view, seq, digest);
            self.sender_handle.broadcast(commit.clone());

            Event::Commit(CommitEvent {
                timestamp: SystemTime::now(),
                commit,
            })
            .publish(&self.event_publisher);

            let _ = log.add_commit(self.config.me, view, seq, digest);
        }

        let (commits, prepared, committed) = match log.slot(view, seq) {
            Some(slot) => (slot.commit_count(&digest), slot.prepared, slot.committed),
            None => return,
        };

        if prepared && !committed && commits >= self.replica_set.commit_quorum() {
            log.set_committed(view, seq);

            Event::Committed(CommittedEvent {
                timestamp: SystemTime::now(),
                view,
                seq,
                digest,
                commits,
            })
            .publish(&self.event_publisher);
        }
    }

    /// Apply every committed, unexecuted slot whose sequence number is next in line. For each:
    /// apply the request to the application, produce and cache a REPLY, hand it to the client
    /// gateway, and mark the slot executed. Execution never skips a sequence number.
    pub(crate) fn execute_ready(
        &mut self,
        log: &mut ReplicaLog,
        app: &mut impl App,
    ) -> Result<bool, PbftError> {
        let mut executed_any = false;

        while let Some((view, seq)) = log.next_executable() {
            let request = match log.slot(view, seq).and_then(|slot| slot.accepted.as_ref()) {
                Some((_, request)) => request.clone(),
                None => return Err(PbftError::CommittedSlotWithoutRequest { view, seq }),
            };

            let result = app.apply(&request);
            let reply = Reply::new(
                &self.config.keypair,
                self.config.me,
                view,
                seq,
                request.client.clone(),
                request.timestamp,
                result,
            );

            log.cache_reply(reply.clone());
            self.gateway.send_reply(reply.clone());
            log.mark_executed(view, seq)?;

            Event::Execute(ExecuteEvent {
                timestamp: SystemTime::now(),
                seq,
                reply,
            })
            .publish(&self.event_publisher);

            executed_any = true;
        }

        Ok(executed_any)
    }
}
