/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local PBFT-rs replica.
//!
//! ## Event enum
//!
//! Significant occurences in the replica include accepting a PRE-PREPARE, reaching a prepare or
//! commit quorum, executing a request, or advancing the view.
//!
//! Each of these occurences corresponds to a variant of the [event enum](Event). Each variant
//! tuple contains an inner struct type storing information that summarizes the particular kind
//! of event, always including a timestamp corresponding to the exact time when the event occured.
//!
//! ## Registering event handlers
//!
//! Library users can register event handler closures, which are internally called by the
//! [event bus](crate::event_bus::start_event_bus) thread when the handler's particular event
//! variant happens. Default handlers that log out events can be enabled via
//! [`EventHandlers::new`](crate::event_bus::EventHandlers::new).
//!
//! ## Timing
//!
//! Events are always emitted **after** the corresponding occurence is "completed". For example,
//! the [execute event](ExecuteEvent) is only emitted after the reply has been cached and handed
//! to the client gateway.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::pbft::messages::{ClientRequest, Commit, PrePrepare, Prepare, Reply};
use crate::types::basic::{Digest, ReplicaId, SequenceNumber, ViewNumber};
use crate::view_sync::messages::SetView;

/// Enumerates all events defined for PBFT-rs.
pub enum Event {
    // Events on the client request path.
    ReceiveRequest(ReceiveRequestEvent),
    ForwardRequest(ForwardRequestEvent),

    // Events that involve broadcasting a protocol message.
    PrePrepare(PrePrepareEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),

    // Events that involve receiving a protocol message.
    ReceivePrePrepare(ReceivePrePrepareEvent),
    ReceivePrepare(ReceivePrepareEvent),
    ReceiveCommit(ReceiveCommitEvent),

    // Quorum and execution events.
    Prepared(PreparedEvent),
    Committed(CommittedEvent),
    Execute(ExecuteEvent),

    // Fault and view advance events.
    Equivocation(EquivocationEvent),
    ViewTimeout(ViewTimeoutEvent),
    SetView(SetViewEvent),
    ReceiveSetView(ReceiveSetViewEvent),
    StartView(StartViewEvent),
}

impl Event {
    /// Publishes a given instance of the [Event] enum on the event publisher channel (if the
    /// channel is defined).
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A client request arrived at this replica, either directly from a client or forwarded by a
/// backup.
pub struct ReceiveRequestEvent {
    pub timestamp: SystemTime,
    pub request: ClientRequest,
}

/// This replica is a backup and relayed a client request to the primary of the current view.
pub struct ForwardRequestEvent {
    pub timestamp: SystemTime,
    pub primary: ReplicaId,
    pub request: ClientRequest,
}

/// This replica is the primary and broadcast a PRE-PREPARE ordering a request.
pub struct PrePrepareEvent {
    pub timestamp: SystemTime,
    pub pre_prepare: PrePrepare,
}

/// This replica broadcast a PREPARE endorsing the primary's ordering.
pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub prepare: Prepare,
}

/// This replica broadcast a COMMIT for a prepared slot.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub commit: Commit,
}

/// A PRE-PREPARE was received and accepted into the log.
pub struct ReceivePrePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub pre_prepare: PrePrepare,
}

/// A PREPARE was received and recorded.
pub struct ReceivePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub prepare: Prepare,
}

/// A COMMIT was received and recorded.
pub struct ReceiveCommitEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub commit: Commit,
}

/// A slot collected its PRE-PREPARE plus a `2f` prepare quorum and became prepared.
pub struct PreparedEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: Digest,
    pub prepares: usize,
}

/// A prepared slot collected a `2f + 1` commit quorum and became committed-local.
pub struct CommittedEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: Digest,
    pub commits: usize,
}

/// A committed slot was executed and its reply cached and handed to the client gateway.
pub struct ExecuteEvent {
    pub timestamp: SystemTime,
    pub seq: SequenceNumber,
    pub reply: Reply,
}

/// Evidence that the primary of the given view equivocated at the given slot.
pub struct EquivocationEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub accepted: Digest,
    pub conflicting: Option<Digest>,
}

/// The progress timer expired while in-flight slots were unresolved.
pub struct ViewTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
}

/// This replica moved to a higher view and broadcast a SET-VIEW announcing it.
pub struct SetViewEvent {
    pub timestamp: SystemTime,
    pub set_view: SetView,
}

/// A SET-VIEW for a higher view was received from a peer.
pub struct ReceiveSetViewEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub set_view: SetView,
}

/// This replica entered a new view.
pub struct StartViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub primary: ReplicaId,
}
