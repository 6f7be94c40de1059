/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages of the simplified view advance protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::SignedMessage;
use crate::types::{
    basic::{ReplicaId, SignatureBytes, ViewNumber},
    keypair::Keypair,
};

/// An announcement that the sender has moved to `view` and why. Receivers adopt the view iff it is
/// strictly higher than their current one, so views are monotonic at every honest replica.
///
/// This is deliberately weaker than the view-change subprotocol of full PBFT: no prepared
/// certificates are carried over, and no quorum of view-change messages is required. It is enough
/// to rotate the cluster away from a crashed or equivocating primary in this simulator, and the
/// place where a full view change would slot in.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct SetView {
    pub replica: ReplicaId,
    pub view: ViewNumber,
    pub reason: String,
    pub signature: SignatureBytes,
}

impl SetView {
    pub fn new(keypair: &Keypair, replica: ReplicaId, view: ViewNumber, reason: String) -> SetView {
        let signature = keypair.sign(&set_view_bytes(&replica, &view, &reason));
        SetView {
            replica,
            view,
            reason,
            signature,
        }
    }
}

impl SignedMessage for SetView {
    fn message_bytes(&self) -> Vec<u8> {
        set_view_bytes(&self.replica, &self.view, &self.reason)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

fn set_view_bytes(replica: &ReplicaId, view: &ViewNumber, reason: &str) -> Vec<u8> {
    ("SET-VIEW", replica, view, reason).try_to_vec().unwrap()
}

/// Messages exchanged between replicas to keep their views synchronized.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum ViewSyncMessage {
    SetView(SetView),
}

impl ViewSyncMessage {
    pub fn sender(&self) -> ReplicaId {
        match self {
            ViewSyncMessage::SetView(msg) => msg.replica,
        }
    }

    pub fn view(&self) -> ViewNumber {
        match self {
            ViewSyncMessage::SetView(msg) => msg.view,
        }
    }
}
