/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, as well as the internal
//! types and functions that replicas use to interact with the network.
//!
//! PBFT-rs has modular peer-to-peer networking, with each peer reachable by its [ReplicaId].
//! Networking providers interact with PBFT-rs' threads through implementations of the [Network]
//! trait. The provider must give reliable, ordered, authenticated point-to-point delivery
//! between any two replicas once both are up: delivery may be delayed arbitrarily but not
//! corrupted, and reconnection is transparent. Partial broadcast failures are tolerated because
//! quorum counting handles missing peers.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::messages::Message;
use crate::pbft::messages::Reply;
use crate::types::basic::{BufferSize, ReplicaId, ViewNumber};
use crate::types::replica_set::ReplicaSet;

pub trait Network: Clone + Send {
    /// Informs the network provider of the replica set on wake-up.
    fn init_replica_set(&mut self, replica_set: ReplicaSet);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: ReplicaId, message: Message);

    /// Send a message to all other peers without blocking. Defined as iteration over the peer
    /// set; peers that are unreachable are skipped.
    fn broadcast(&mut self, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is
    /// available now.
    fn recv(&mut self) -> Option<(ReplicaId, Message)>;

    /// Whether a live connection to the given peer currently exists. Purely informational: the
    /// protocol observes missing peers through missing messages, not through this method.
    fn peer_up(&self, peer: ReplicaId) -> bool;
}

/// The seam through which REPLY messages leave the protocol toward clients.
///
/// Clients are not part of the replica set, so replies do not travel over the [Network]. The
/// in-process test harness implements this with shared inboxes; the TCP build implements it with
/// a registry of observer connections.
pub trait ClientGateway: Send + 'static {
    fn send_reply(&mut self, reply: Reply);
}

/// Spawn the poller thread, which polls the [Network] for messages and forwards them into the
/// receiver drained by the [algorithm](crate::algorithm) thread's
/// [ProgressMessageStub].
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<(ReplicaId, Message)>) {
    let (to_progress_msg_receiver, progress_msg_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, msg)) = network.recv() {
            let _ = to_progress_msg_receiver.send((origin, msg));
        } else {
            thread::yield_now()
        }
    });

    (poller_thread, progress_msg_receiver)
}

/// Handle for sending and broadcasting messages to the [Network]. Can be used to send or
/// broadcast messages of message types that implement the [Into<Message>] trait.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    pub(crate) fn send<S: Into<Message>>(&mut self, peer: ReplicaId, msg: S) {
        self.network.send(peer, msg.into())
    }

    pub(crate) fn broadcast<S: Into<Message>>(&mut self, msg: S) {
        self.network.broadcast(msg.into())
    }
}

/// A receiving end for progress messages. Performs pre-processing of the received messages,
/// returning the messages immediately or storing them in the buffer.
///
/// ### PBFT messages
/// This type's recv method only returns PBFT messages for the current view, caches messages from
/// future views for consumption after a view advance, and silently drops messages from older
/// views. Forwarded requests are not view-bound and are returned immediately.
///
/// ### View sync messages
/// SET-VIEW messages for the current view or any future view are returned immediately; replicas
/// must be able to learn about higher views without first entering them.
///
/// ### Buffer management
/// Future-view messages are buffered in per-sender FIFO queues bounded at the configured
/// capacity. When a sender's queue is full, the oldest buffered message from that sender is
/// dropped to make space.
pub(crate) struct ProgressMessageStub {
    receiver: Receiver<(ReplicaId, Message)>,
    buffer_capacity: BufferSize,
    buffer: HashMap<ReplicaId, VecDeque<(ViewNumber, Message)>>,
}

impl ProgressMessageStub {
    /// Create a fresh [ProgressMessageStub] with a given receiver end and per-sender buffer
    /// capacity.
    pub(crate) fn new(
        receiver: Receiver<(ReplicaId, Message)>,
        buffer_capacity: BufferSize,
    ) -> ProgressMessageStub {
        Self {
            receiver,
            buffer_capacity,
            buffer: HashMap::new(),
        }
    }

    /// Receive a message usable in `cur_view`. Cache and/or return immediately, depending on the
    /// message type. Waits until `deadline` before giving up with
    /// [ProgressMessageReceiveError::Timeout].
    pub(crate) fn recv(
        &mut self,
        cur_view: ViewNumber,
        deadline: Instant,
    ) -> Result<(ReplicaId, Message), ProgressMessageReceiveError> {
        // Clear the buffer of messages with views lower than the current one.
        self.remove_expired_msgs(cur_view);

        // Try to get a buffered message for the current view.
        if let Some((sender, msg)) = self.get_buffered_msg(cur_view) {
            return Ok((sender, msg));
        }

        // Try to get messages from the poller.
        while Instant::now() < deadline {
            match self.receiver.recv_timeout(deadline - Instant::now()) {
                Ok((sender, msg)) => {
                    match msg.view() {
                        // Not view-bound (forwarded requests): return immediately.
                        None => return Ok((sender, msg)),

                        Some(view) if view == cur_view => return Ok((sender, msg)),

                        Some(view) if view > cur_view => {
                            // SET-VIEW messages for higher views are how replicas catch up, so
                            // they are returned immediately. Everything else waits for the view.
                            if matches!(msg, Message::ViewSyncMessage(_)) {
                                return Ok((sender, msg));
                            }
                            self.insert(sender, view, msg);
                        }

                        // Stale view: drop silently.
                        Some(_) => (),
                    }
                }
                Err(RecvTimeoutError::Timeout) => thread::yield_now(),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ProgressMessageReceiveError::Disconnected)
                }
            }
        }

        Err(ProgressMessageReceiveError::Timeout)
    }

    /// Buffer a future-view message from `sender`, dropping that sender's oldest buffered
    /// message if its queue is at capacity.
    fn insert(&mut self, sender: ReplicaId, view: ViewNumber, msg: Message) {
        let queue = self.buffer.entry(sender).or_insert_with(VecDeque::new);
        if queue.len() >= self.buffer_capacity.int() {
            queue.pop_front();
        }
        queue.push_back((view, msg));
    }

    /// If any sender has a buffered message for this view, remove and return the earliest such
    /// message from its queue.
    fn get_buffered_msg(&mut self, cur_view: ViewNumber) -> Option<(ReplicaId, Message)> {
        for (sender, queue) in self.buffer.iter_mut() {
            if let Some(pos) = queue.iter().position(|(view, _)| *view == cur_view) {
                let (_, msg) = queue.remove(pos).unwrap();
                return Some((*sender, msg));
            }
        }
        None
    }

    /// Remove all buffered messages for views less than the current view.
    fn remove_expired_msgs(&mut self, cur_view: ViewNumber) {
        for queue in self.buffer.values_mut() {
            queue.retain(|(view, _)| *view >= cur_view);
        }
    }
}

#[derive(Debug)]
pub(crate) enum ProgressMessageReceiveError {
    Timeout,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Sender;
    use std::time::Duration;

    use ed25519_dalek::SigningKey;

    use crate::pbft::messages::{ClientRequest, Prepare};
    use crate::types::basic::{ClientId, SequenceNumber, Timestamp};
    use crate::types::keypair::Keypair;
    use crate::view_sync::messages::SetView;

    use super::*;

    fn keypair() -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[9; 32]))
    }

    fn prepare_at_view(view: u64) -> Message {
        let request = ClientRequest::new(
            ClientId::new("c1".to_string()),
            Timestamp::new(1),
            b"x".to_vec(),
        );
        Prepare::new(
            &keypair(),
            ReplicaId::new(1),
            ViewNumber::new(view),
            SequenceNumber::init(),
            request.digest(),
        )
        .into()
    }

    fn stub(capacity: usize) -> (Sender<(ReplicaId, Message)>, ProgressMessageStub) {
        let (sender, receiver) = mpsc::channel();
        (sender, ProgressMessageStub::new(receiver, BufferSize::new(capacity)))
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn current_view_messages_pass_through() {
        let (sender, mut stub) = stub(8);
        sender.send((ReplicaId::new(1), prepare_at_view(0))).unwrap();
        assert!(stub.recv(ViewNumber::new(0), soon()).is_ok());
    }

    #[test]
    fn stale_messages_are_dropped_and_future_messages_buffered() {
        let (sender, mut stub) = stub(8);
        sender.send((ReplicaId::new(1), prepare_at_view(1))).unwrap();
        sender.send((ReplicaId::new(1), prepare_at_view(0))).unwrap();

        // In view 2 both are stale and dropped outright.
        assert!(matches!(
            stub.recv(ViewNumber::new(2), soon()),
            Err(ProgressMessageReceiveError::Timeout)
        ));

        // A view-1 message received while in view 0 is buffered and returned on view advance.
        sender.send((ReplicaId::new(1), prepare_at_view(1))).unwrap();
        assert!(matches!(
            stub.recv(ViewNumber::new(0), soon()),
            Err(ProgressMessageReceiveError::Timeout)
        ));
        assert!(stub.recv(ViewNumber::new(1), soon()).is_ok());
    }

    #[test]
    fn set_view_for_a_higher_view_returns_immediately() {
        let (sender, mut stub) = stub(8);
        let set_view: Message =
            SetView::new(&keypair(), ReplicaId::new(1), ViewNumber::new(5), "test".to_string())
                .into();
        sender.send((ReplicaId::new(1), set_view)).unwrap();

        let (_, msg) = stub.recv(ViewNumber::new(0), soon()).unwrap();
        assert!(matches!(msg, Message::ViewSyncMessage(_)));
    }

    #[test]
    fn full_sender_queue_drops_the_oldest_message() {
        let (sender, mut stub) = stub(2);
        // Three future-view messages from the same sender; capacity two.
        sender.send((ReplicaId::new(1), prepare_at_view(1))).unwrap();
        sender.send((ReplicaId::new(1), prepare_at_view(2))).unwrap();
        sender.send((ReplicaId::new(1), prepare_at_view(3))).unwrap();

        assert!(matches!(
            stub.recv(ViewNumber::new(0), soon()),
            Err(ProgressMessageReceiveError::Timeout)
        ));

        // The view-1 message (oldest) was evicted; views 2 and 3 survive.
        assert!(matches!(
            stub.recv(ViewNumber::new(1), soon()),
            Err(ProgressMessageReceiveError::Timeout)
        ));
        assert!(stub.recv(ViewNumber::new(2), soon()).is_ok());
        assert!(stub.recv(ViewNumber::new(3), soon()).is_ok());
    }
}
