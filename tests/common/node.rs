//! A thin wrapper over a [Replica] started against the mock network, with the conveniences the
//! test scenarios need.

use std::collections::HashMap;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use pbft_rs::{
    config::{Configuration, IdentityConfig, NetworkingConfiguration, ProtocolConfig},
    event_bus::EventHandlers,
    observer::{self, Status, StatusCamera},
    pbft::messages::ClientRequest,
    types::{
        basic::{BufferSize, ClientId, ReplicaId, Timestamp},
        keypair::Keypair,
        replica_set::ReplicaSet,
    },
    EchoApp, Replica,
};

use super::{gateway::ReplyInbox, network::NetworkStub};

/// The deterministic keypair of replica `id`, shared between nodes and tests playing Byzantine
/// replicas.
pub(crate) fn keypair(id: u32) -> Keypair {
    Keypair::new(SigningKey::from_bytes(&[id as u8; 32]))
}

/// The replica set of a cluster with ids `0..n`.
pub(crate) fn replica_set(n: u32) -> ReplicaSet {
    ReplicaSet::new(
        (0..n)
            .map(|id| (ReplicaId::new(id), keypair(id).public()))
            .collect(),
    )
}

pub(crate) struct Node {
    replica: Replica,
}

impl Node {
    pub(crate) fn new(
        id: u32,
        network: NetworkStub,
        inbox: ReplyInbox,
        replica_set: ReplicaSet,
        progress_timeout: Duration,
    ) -> Node {
        let id = ReplicaId::new(id);
        let config = Configuration {
            identity: IdentityConfig {
                me: id,
                keypair: keypair(id.int()),
                replica_set: replica_set.clone(),
            },
            protocol: ProtocolConfig {
                seq_window: None,
                progress_timeout,
                message_buffer_capacity: BufferSize::new(256),
            },
            // The mock network never dials; the transport section is inert.
            networking: NetworkingConfiguration {
                listening_addr: "127.0.0.1".parse().unwrap(),
                listening_port: 0,
                peer_addrs: HashMap::new(),
                initiator_timeout: Duration::from_millis(500),
                reconnect_interval: Duration::from_millis(500),
                writer_channel_buffer_len: 1024,
            },
        };

        let (submit_handle, submissions) = observer::submit_channel();
        let camera = StatusCamera::new(Status::initial(id, &replica_set));
        let replica = Replica::start(
            config,
            EchoApp,
            network,
            inbox,
            submissions,
            submit_handle,
            camera,
            EventHandlers::logging_only(true),
        );

        Node { replica }
    }

    pub(crate) fn submit(&self, client: &str, timestamp: u64, payload: &[u8]) {
        self.replica.submit(ClientRequest::new(
            ClientId::new(client.to_string()),
            Timestamp::new(timestamp),
            payload.to_vec(),
        ));
    }

    pub(crate) fn status(&self) -> Status {
        self.replica.status()
    }

    pub(crate) fn last_executed(&self) -> Option<u64> {
        self.status().last_executed.map(|seq| seq.int())
    }

    pub(crate) fn view(&self) -> u64 {
        self.status().view.int()
    }
}
