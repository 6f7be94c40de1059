//! A shared client inbox standing in for the client side of the cluster: every replica's
//! replies land in one place, where tests count them the way a real PBFT client would.

use std::sync::{Arc, Mutex};

use pbft_rs::{
    networking::ClientGateway,
    pbft::messages::Reply,
    types::basic::{ClientId, ReplicaId, Timestamp},
};

#[derive(Clone)]
pub(crate) struct ReplyInbox {
    replies: Arc<Mutex<Vec<Reply>>>,
}

impl ReplyInbox {
    pub(crate) fn new() -> ReplyInbox {
        ReplyInbox {
            replies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// All replies received so far for `(client, timestamp)`.
    pub(crate) fn replies_for(&self, client: &str, timestamp: u64) -> Vec<Reply> {
        let client = ClientId::new(client.to_string());
        let timestamp = Timestamp::new(timestamp);
        self.replies
            .lock()
            .unwrap()
            .iter()
            .filter(|reply| reply.client == client && reply.timestamp == timestamp)
            .cloned()
            .collect()
    }

    /// How many *distinct* replicas have replied to `(client, timestamp)` with `result`. This is
    /// the count a PBFT client compares against `f + 1`.
    pub(crate) fn matching_replicas(&self, client: &str, timestamp: u64, result: &[u8]) -> usize {
        let mut replicas: Vec<ReplicaId> = self
            .replies_for(client, timestamp)
            .into_iter()
            .filter(|reply| reply.result == result)
            .map(|reply| reply.replica)
            .collect();
        replicas.sort();
        replicas.dedup();
        replicas.len()
    }
}

impl ClientGateway for ReplyInbox {
    fn send_reply(&mut self, reply: Reply) {
        self.replies.lock().unwrap().push(reply);
    }
}
