/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the simplified view advance subprotocol.
//!
//! Main type: [`ViewSync`].

use std::sync::mpsc::Sender;
use std::time::{Duration, Instant, SystemTime};

use crate::events::{
    Event, ReceiveSetViewEvent, SetViewEvent, StartViewEvent, ViewTimeoutEvent,
};
use crate::networking::{Network, SenderHandle};
use crate::state::ReplicaLog;
use crate::types::{
    basic::{ReplicaId, ViewNumber},
    keypair::Keypair,
    replica_set::ReplicaSet,
};
use crate::view_sync::messages::{SetView, ViewSyncMessage};

/// Keeps the local view synchronized with the cluster and rotates it away from a primary that
/// stops making progress.
///
/// The replica carries one progress timer, reset whenever the three-phase protocol advances any
/// slot. If the timer expires while proposed-but-unexecuted slots exist in the current view, the
/// replica moves to the next view and broadcasts a [SetView] so its peers follow. The same
/// advance is triggered directly when the agreement protocol convicts the primary of
/// equivocation.
///
/// This is the extension point where the full PBFT view-change subprotocol (with prepared
/// certificates carried across views) would be implemented.
pub(crate) struct ViewSync<N: Network> {
    config: ViewSyncConfiguration,
    replica_set: ReplicaSet,
    deadline: Instant,
    sender_handle: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
}

/// Configuration parameters for the [`ViewSync`] struct.
#[derive(Clone)]
pub(crate) struct ViewSyncConfiguration {
    pub(crate) me: ReplicaId,
    pub(crate) keypair: Keypair,

    /// How long a stalled in-flight slot is tolerated before the current primary is given up on.
    pub(crate) progress_timeout: Duration,
}

impl<N: Network> ViewSync<N> {
    pub(crate) fn new(
        config: ViewSyncConfiguration,
        replica_set: ReplicaSet,
        sender_handle: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let deadline = Instant::now() + config.progress_timeout;
        Self {
            config,
            replica_set,
            deadline,
            sender_handle,
            event_publisher,
        }
    }

    /// Reset the progress timer. Called whenever the agreement protocol advances any slot.
    pub(crate) fn note_progress(&mut self) {
        self.deadline = Instant::now() + self.config.progress_timeout;
    }

    /// Cause the view sync to check the current time ("clock tick"). If the progress timer has
    /// expired and the current view holds stalled slots, move past the current primary.
    pub(crate) fn tick(&mut self, log: &mut ReplicaLog) {
        if Instant::now() <= self.deadline {
            return;
        }

        if log.has_stalled_slots() {
            Event::ViewTimeout(ViewTimeoutEvent {
                timestamp: SystemTime::now(),
                view: log.view(),
            })
            .publish(&self.event_publisher);

            self.advance_view(log, "progress timeout".to_string());
        } else {
            // Nothing is in flight; an idle cluster is not a stalled one.
            self.note_progress();
        }
    }

    /// Move to the view after the current one and announce the move to all peers.
    pub(crate) fn advance_view(&mut self, log: &mut ReplicaLog, reason: String) {
        let next = log.view() + 1;

        let set_view = SetView::new(&self.config.keypair, self.config.me, next, reason);
        self.sender_handle.broadcast(set_view.clone());

        Event::SetView(SetViewEvent {
            timestamp: SystemTime::now(),
            set_view,
        })
        .publish(&self.event_publisher);

        self.enter_view(log, next);
    }

    /// Execute the required steps upon receiving a `ViewSyncMessage` from the replica identified
    /// by `origin`.
    pub(crate) fn on_receive_msg(
        &mut self,
        msg: ViewSyncMessage,
        origin: ReplicaId,
        log: &mut ReplicaLog,
    ) {
        match msg {
            ViewSyncMessage::SetView(set_view) => self.on_receive_set_view(set_view, origin, log),
        }
    }

    /// Adopt the announced view iff it is strictly higher than the current one. Views are
    /// monotonic: announcements of the current or an older view are idempotent no-ops.
    fn on_receive_set_view(&mut self, set_view: SetView, origin: ReplicaId, log: &mut ReplicaLog) {
        if set_view.view <= log.view() {
            return;
        }

        Event::ReceiveSetView(ReceiveSetViewEvent {
            timestamp: SystemTime::now(),
            origin,
            set_view: set_view.clone(),
        })
        .publish(&self.event_publisher);

        self.enter_view(log, set_view.view);
    }

    fn enter_view(&mut self, log: &mut ReplicaLog, view: ViewNumber) {
        log.enter_view(view);
        self.note_progress();

        Event::StartView(StartViewEvent {
            timestamp: SystemTime::now(),
            view,
            primary: self.replica_set.primary(view),
        })
        .publish(&self.event_publisher);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ed25519_dalek::SigningKey;

    use crate::messages::Message;
    use crate::pbft::messages::ClientRequest;
    use crate::types::basic::{ClientId, SequenceNumber, Timestamp};

    use super::*;

    #[derive(Clone)]
    struct RecordingNetwork {
        broadcasts: Arc<Mutex<Vec<Message>>>,
    }

    impl RecordingNetwork {
        fn new() -> RecordingNetwork {
            RecordingNetwork {
                broadcasts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn broadcast_count(&self) -> usize {
            self.broadcasts.lock().unwrap().len()
        }
    }

    impl Network for RecordingNetwork {
        fn init_replica_set(&mut self, _: ReplicaSet) {}

        fn send(&mut self, _: ReplicaId, _: Message) {}

        fn broadcast(&mut self, message: Message) {
            self.broadcasts.lock().unwrap().push(message);
        }

        fn recv(&mut self) -> Option<(ReplicaId, Message)> {
            None
        }

        fn peer_up(&self, _: ReplicaId) -> bool {
            true
        }
    }

    fn keypair(id: u32) -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[id as u8; 32]))
    }

    fn replica_set() -> ReplicaSet {
        ReplicaSet::new(
            (0..4)
                .map(|id| (ReplicaId::new(id), keypair(id).public()))
                .collect(),
        )
    }

    fn view_sync(
        timeout: Duration,
    ) -> (ViewSync<RecordingNetwork>, RecordingNetwork, ReplicaLog) {
        let network = RecordingNetwork::new();
        let config = ViewSyncConfiguration {
            me: ReplicaId::new(1),
            keypair: keypair(1),
            progress_timeout: timeout,
        };
        let view_sync = ViewSync::new(
            config,
            replica_set(),
            SenderHandle::new(network.clone()),
            None,
        );
        (view_sync, network, ReplicaLog::new())
    }

    fn stall_a_slot(log: &mut ReplicaLog) {
        let request = ClientRequest::new(
            ClientId::new("c1".to_string()),
            Timestamp::new(1),
            b"x".to_vec(),
        );
        log.accept_pre_prepare(log.view(), SequenceNumber::init(), request.digest(), request)
            .unwrap();
    }

    #[test]
    fn set_view_is_adopted_only_if_strictly_higher() {
        let (mut view_sync, _, mut log) = view_sync(Duration::from_secs(60));

        let higher = SetView::new(&keypair(2), ReplicaId::new(2), ViewNumber::new(3), "x".into());
        view_sync.on_receive_msg(
            ViewSyncMessage::SetView(higher),
            ReplicaId::new(2),
            &mut log,
        );
        assert_eq!(log.view(), ViewNumber::new(3));

        // The same view and an older view are no-ops.
        for old in [3u64, 1] {
            let msg = SetView::new(&keypair(2), ReplicaId::new(2), ViewNumber::new(old), "x".into());
            view_sync.on_receive_msg(ViewSyncMessage::SetView(msg), ReplicaId::new(2), &mut log);
            assert_eq!(log.view(), ViewNumber::new(3));
        }
    }

    #[test]
    fn expired_timer_with_stalled_slots_advances_the_view() {
        let (mut view_sync, network, mut log) = view_sync(Duration::from_millis(0));
        stall_a_slot(&mut log);

        std::thread::sleep(Duration::from_millis(5));
        view_sync.tick(&mut log);

        assert_eq!(log.view(), ViewNumber::new(1));
        assert_eq!(network.broadcast_count(), 1);
    }

    #[test]
    fn expired_timer_without_stalled_slots_is_idle() {
        let (mut view_sync, network, mut log) = view_sync(Duration::from_millis(0));

        std::thread::sleep(Duration::from_millis(5));
        view_sync.tick(&mut log);

        assert_eq!(log.view(), ViewNumber::init());
        assert_eq!(network.broadcast_count(), 0);
    }
}
