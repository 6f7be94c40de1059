//! A "mock" (totally local) network for passing around PBFT-rs messages, with a harness handle
//! through which tests inject faults.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use pbft_rs::{
    messages::Message,
    networking::Network,
    types::{basic::ReplicaId, replica_set::ReplicaSet},
};

/// A network stub that passes messages to and from nodes using channels.
///
/// The set of peers reachable from a given `NetworkStub` is fixed on construction by
/// [`mock_network`]. A replica that is a member of the replica set but never started simply
/// never drains its inbox, which to the rest of the cluster is indistinguishable from a crashed
/// peer.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: ReplicaId,
    all_peers: HashMap<ReplicaId, Sender<(ReplicaId, Message)>>,
    inbox: Arc<Mutex<Receiver<(ReplicaId, Message)>>>,
}

impl Network for NetworkStub {
    fn init_replica_set(&mut self, _: ReplicaSet) {}

    fn send(&mut self, peer: ReplicaId, message: Message) {
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.me, message));
        }
    }

    fn broadcast(&mut self, message: Message) {
        for (peer, sender) in &self.all_peers {
            if *peer != self.me {
                let _ = sender.send((self.me, message.clone()));
            }
        }
    }

    fn recv(&mut self) -> Option<(ReplicaId, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(origin_and_msg) => Some(origin_and_msg),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }

    fn peer_up(&self, peer: ReplicaId) -> bool {
        self.all_peers.contains_key(&peer)
    }
}

/// Lets a test play an arbitrary (possibly Byzantine) member of the replica set: it can deliver
/// any message to any peer under any claimed origin, bypassing the protocol entirely.
pub(crate) struct TestHarness {
    all_peers: HashMap<ReplicaId, Sender<(ReplicaId, Message)>>,
}

impl TestHarness {
    /// Deliver `message` to `to`, as if it had been sent by `as_sender`.
    pub(crate) fn send_as(&self, as_sender: ReplicaId, to: ReplicaId, message: Message) {
        if let Some(peer) = self.all_peers.get(&to) {
            let _ = peer.send((as_sender, message));
        }
    }
}

/// Create a vector of `NetworkStub`s connecting the provided set of `peers`, plus a
/// [`TestHarness`] wired into the same mesh.
///
/// `NetworkStub`s feature in the returned vector in the same order as the provided `peers`,
/// i.e., the i-th network stub is the network stub for the i-th peer.
pub(crate) fn mock_network(
    peers: impl Iterator<Item = ReplicaId>,
) -> (Vec<NetworkStub>, TestHarness) {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(ReplicaId, Receiver<(ReplicaId, Message)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    let stubs = peer_and_inboxes
        .into_iter()
        .map(|(me, inbox)| NetworkStub {
            me,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect();

    (stubs, TestHarness { all_peers })
}
