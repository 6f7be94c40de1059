/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [PeerNetwork]: the TCP implementation of the [Network] trait.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::NetworkingConfiguration;
use crate::ipc::establisher::{start_initiator, start_listener};
use crate::ipc::stream::Stream;
use crate::messages::Message;
use crate::networking::Network;
use crate::observer::ObserverContext;
use crate::types::basic::ReplicaId;
use crate::types::replica_set::ReplicaSet;

/// State shared between the manager, the establisher threads, and the per-connection reader
/// threads.
pub(crate) struct Shared {
    pub(crate) me: ReplicaId,
    pub(crate) replica_set: ReplicaSet,
    pub(crate) config: NetworkingConfiguration,
    pub(crate) conns: RwLock<HashMap<ReplicaId, Stream>>,
    pub(crate) inbox_sender: Sender<(ReplicaId, Message)>,
}

/// Reliable, ordered, authenticated point-to-point transport between replicas over TCP.
///
/// One listening socket per replica carries both peer connections and observer connections,
/// distinguished by a [connection tag](crate::ipc). Peer connections are established
/// deterministically (the replica with the lower id initiates toward the higher id) and
/// re-established transparently by the [establisher](crate::ipc::establisher) when they die.
/// Sends to peers without a live connection are dropped; the protocol's quorum logic tolerates
/// the gap.
#[derive(Clone)]
pub struct PeerNetwork {
    shared: Arc<Shared>,
    inbox: Arc<Mutex<Receiver<(ReplicaId, Message)>>>,
}

impl PeerNetwork {
    /// Bind the listening socket and spawn the establisher threads. Returns
    /// [io::Error] if the socket cannot be bound (startup exit code 2).
    pub fn start(
        config: NetworkingConfiguration,
        me: ReplicaId,
        replica_set: ReplicaSet,
        observer_context: ObserverContext,
    ) -> io::Result<PeerNetwork> {
        let listener = TcpListener::bind(SocketAddr::new(
            config.listening_addr,
            config.listening_port,
        ))?;

        let (inbox_sender, inbox_receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            me,
            replica_set,
            config,
            conns: RwLock::new(HashMap::new()),
            inbox_sender,
        });

        start_listener(Arc::clone(&shared), listener, observer_context);
        start_initiator(Arc::clone(&shared));

        Ok(PeerNetwork {
            shared,
            inbox: Arc::new(Mutex::new(inbox_receiver)),
        })
    }
}

impl Network for PeerNetwork {
    fn init_replica_set(&mut self, _: ReplicaSet) {
        // Membership is fixed at startup; the replica set was handed to `start`.
    }

    fn send(&mut self, peer: ReplicaId, message: Message) {
        let failed = {
            let conns = self.shared.conns.read().unwrap();
            match conns.get(&peer) {
                Some(stream) => stream.write(message).is_err(),
                None => return,
            }
        };

        // A dead stream is removed so the establisher re-creates it.
        if failed {
            self.shared.conns.write().unwrap().remove(&peer);
        }
    }

    fn broadcast(&mut self, message: Message) {
        let peers: Vec<ReplicaId> = self
            .shared
            .replica_set
            .ids()
            .filter(|id| *id != self.shared.me)
            .collect();
        for peer in peers {
            self.send(peer, message.clone());
        }
    }

    fn recv(&mut self) -> Option<(ReplicaId, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(origin_and_msg) => Some(origin_and_msg),
            Err(TryRecvError::Empty) => None,
            // All senders gone means the establisher threads died with the process; nothing
            // more will ever arrive.
            Err(TryRecvError::Disconnected) => None,
        }
    }

    fn peer_up(&self, peer: ReplicaId) -> bool {
        self.shared
            .conns
            .read()
            .unwrap()
            .get(&peer)
            .map_or(false, |stream| stream.is_alive())
    }
}
