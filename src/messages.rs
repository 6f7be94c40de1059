/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas.
//!
//! This includes the messages of the [three-phase agreement protocol](crate::pbft::messages) and
//! those of the [simplified view advance protocol](crate::view_sync::messages).

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::pbft::messages::{Commit, Forward, PbftMessage, PrePrepare, Prepare};
use crate::types::basic::{ReplicaId, SignatureBytes, ViewNumber};
use crate::view_sync::messages::{SetView, ViewSyncMessage};

/// A message that serves to advance the ordered log, which may involve:
/// 1. Participating in three-phase agreement via a [PbftMessage], or
/// 2. Moving the cluster past a suspected primary via a [ViewSyncMessage].
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum Message {
    PbftMessage(PbftMessage),
    ViewSyncMessage(ViewSyncMessage),
}

impl Message {
    /// The id the sender of this message claims for itself. Receivers verify this claim against
    /// the message's authenticator and the transport origin before acting on it.
    pub fn sender(&self) -> ReplicaId {
        match self {
            Message::PbftMessage(msg) => msg.sender(),
            Message::ViewSyncMessage(msg) => msg.sender(),
        }
    }

    /// The view this message belongs to, if it is view-bound.
    ///
    /// [Forward](crate::pbft::messages::Forward) messages are not view-bound and return `None`:
    /// a forwarded request is meaningful whatever view the receiver is in.
    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            Message::PbftMessage(msg) => msg.view(),
            Message::ViewSyncMessage(msg) => Some(msg.view()),
        }
    }

    /// Verify this message's authenticator against the claimed sender's public key.
    pub fn is_correct(&self, pk: &VerifyingKey) -> bool {
        match self {
            Message::PbftMessage(msg) => match msg {
                PbftMessage::PrePrepare(m) => m.is_correct(pk),
                PbftMessage::Prepare(m) => m.is_correct(pk),
                PbftMessage::Commit(m) => m.is_correct(pk),
                PbftMessage::Forward(m) => m.is_correct(pk),
            },
            Message::ViewSyncMessage(msg) => match msg {
                ViewSyncMessage::SetView(m) => m.is_correct(pk),
            },
        }
    }
}

/// A signed message must consist of:
/// 1. Message bytes [SignedMessage::message_bytes]: the values that the signature is over, and
/// 2. Signature bytes [SignedMessage::signature_bytes]: the signature in bytes.
///
/// Given the two values satisfying the above, and a public key of the signer, the signature can be
/// verified against the message. In simulation mode the key material is derived deterministically,
/// but the verification path is real: forged or tampered messages fail [is_correct] and are
/// dropped and counted by the receiving replica.
///
/// [is_correct]: SignedMessage::is_correct
pub trait SignedMessage: Clone {
    /// The values contained in the message that should be signed (represented as a vector of bytes).
    fn message_bytes(&self) -> Vec<u8>;

    /// The signature (in bytes) carried by the message.
    fn signature_bytes(&self) -> SignatureBytes;

    /// Verifies the correctness of the signature given the values that should be signed.
    fn is_correct(&self, pk: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&self.signature_bytes().bytes());
        pk.verify(&self.message_bytes(), &signature).is_ok()
    }
}

impl From<PrePrepare> for Message {
    fn from(value: PrePrepare) -> Self {
        Message::PbftMessage(PbftMessage::PrePrepare(value))
    }
}

impl From<Prepare> for Message {
    fn from(value: Prepare) -> Self {
        Message::PbftMessage(PbftMessage::Prepare(value))
    }
}

impl From<Commit> for Message {
    fn from(value: Commit) -> Self {
        Message::PbftMessage(PbftMessage::Commit(value))
    }
}

impl From<Forward> for Message {
    fn from(value: Forward) -> Self {
        Message::PbftMessage(PbftMessage::Forward(value))
    }
}

impl From<SetView> for Message {
    fn from(value: SetView) -> Self {
        Message::ViewSyncMessage(ViewSyncMessage::SetView(value))
    }
}

impl From<PbftMessage> for Message {
    fn from(value: PbftMessage) -> Self {
        Message::PbftMessage(value)
    }
}

impl From<ViewSyncMessage> for Message {
    fn from(value: ViewSyncMessage) -> Self {
        Message::ViewSyncMessage(value)
    }
}
