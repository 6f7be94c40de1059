/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages of the three-phase agreement protocol.
//!
//! Every inter-replica message carries the sender's claimed [id](ReplicaId), the view it was
//! produced in, and an ed25519 signature over its protocol-relevant fields. [Reply] is special:
//! it is addressed to a client rather than a replica, and leaves the replica through the
//! [client gateway](crate::networking::ClientGateway) instead of the inter-replica network.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::messages::SignedMessage;
use crate::types::{
    basic::{ClientId, Digest, ReplicaId, SequenceNumber, SignatureBytes, Timestamp, ViewNumber},
    keypair::Keypair,
};

/// A request submitted by a client: who is asking, when they asked (client-local, monotonic per
/// client), and an opaque payload.
///
/// The `forwarded` flag is set when a backup relays the request to the primary, and suppresses
/// any further forwarding. It is excluded from the [digest](Self::digest), so a request and its
/// forwarded copy are the same request.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ClientRequest {
    pub client: ClientId,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
    pub forwarded: bool,
}

impl ClientRequest {
    pub fn new(client: ClientId, timestamp: Timestamp, payload: Vec<u8>) -> ClientRequest {
        ClientRequest {
            client,
            timestamp,
            payload,
            forwarded: false,
        }
    }

    /// Compute the collision-resistant digest identifying this request. Two requests are equal
    /// iff their digests match.
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(
            (&self.client, &self.timestamp, &self.payload)
                .try_to_vec()
                .unwrap(),
        );
        Digest::new(hasher.finalize().into())
    }
}

/// The primary's proposal ordering a request at a sequence number within its view.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct PrePrepare {
    pub replica: ReplicaId,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: Digest,
    pub request: ClientRequest,
    pub signature: SignatureBytes,
}

impl PrePrepare {
    pub fn new(
        keypair: &Keypair,
        replica: ReplicaId,
        view: ViewNumber,
        seq: SequenceNumber,
        request: ClientRequest,
    ) -> PrePrepare {
        let digest = request.digest();
        let signature = keypair.sign(&pre_prepare_bytes(&replica, &view, &seq, &digest));
        PrePrepare {
            replica,
            view,
            seq,
            digest,
            request,
            signature,
        }
    }
}

impl SignedMessage for PrePrepare {
    fn message_bytes(&self) -> Vec<u8> {
        pre_prepare_bytes(&self.replica, &self.view, &self.seq, &self.digest)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

fn pre_prepare_bytes(
    replica: &ReplicaId,
    view: &ViewNumber,
    seq: &SequenceNumber,
    digest: &Digest,
) -> Vec<u8> {
    ("PRE-PREPARE", replica, view, seq, digest)
        .try_to_vec()
        .unwrap()
}

/// A backup's endorsement of the primary's ordering of `digest` at `(view, seq)`.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub replica: ReplicaId,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: Digest,
    pub signature: SignatureBytes,
}

impl Prepare {
    pub fn new(
        keypair: &Keypair,
        replica: ReplicaId,
        view: ViewNumber,
        seq: SequenceNumber,
        digest: Digest,
    ) -> Prepare {
        let signature = keypair.sign(&vote_bytes("PREPARE", &replica, &view, &seq, &digest));
        Prepare {
            replica,
            view,
            seq,
            digest,
            signature,
        }
    }
}

impl SignedMessage for Prepare {
    fn message_bytes(&self) -> Vec<u8> {
        vote_bytes("PREPARE", &self.replica, &self.view, &self.seq, &self.digest)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

/// A replica's announcement that it holds a prepared certificate for `digest` at `(view, seq)`
/// and intends to execute it.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub replica: ReplicaId,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: Digest,
    pub signature: SignatureBytes,
}

impl Commit {
    pub fn new(
        keypair: &Keypair,
        replica: ReplicaId,
        view: ViewNumber,
        seq: SequenceNumber,
        digest: Digest,
    ) -> Commit {
        let signature = keypair.sign(&vote_bytes("COMMIT", &replica, &view, &seq, &digest));
        Commit {
            replica,
            view,
            seq,
            digest,
            signature,
        }
    }
}

impl SignedMessage for Commit {
    fn message_bytes(&self) -> Vec<u8> {
        vote_bytes("COMMIT", &self.replica, &self.view, &self.seq, &self.digest)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

fn vote_bytes(
    kind: &str,
    replica: &ReplicaId,
    view: &ViewNumber,
    seq: &SequenceNumber,
    digest: &Digest,
) -> Vec<u8> {
    (kind, replica, view, seq, digest).try_to_vec().unwrap()
}

/// A client request relayed by a backup to the primary. The contained request has its
/// `forwarded` flag set, which stops the receiver from forwarding it again.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Forward {
    pub replica: ReplicaId,
    pub request: ClientRequest,
    pub signature: SignatureBytes,
}

impl Forward {
    pub fn new(keypair: &Keypair, replica: ReplicaId, mut request: ClientRequest) -> Forward {
        request.forwarded = true;
        let signature = keypair.sign(&forward_bytes(&replica, &request));
        Forward {
            replica,
            request,
            signature,
        }
    }
}

impl SignedMessage for Forward {
    fn message_bytes(&self) -> Vec<u8> {
        forward_bytes(&self.replica, &self.request)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

fn forward_bytes(replica: &ReplicaId, request: &ClientRequest) -> Vec<u8> {
    ("FORWARD", replica, &request.digest()).try_to_vec().unwrap()
}

/// The result of executing a client request, addressed to the client that submitted it.
///
/// A client considers its request done once it has collected `f + 1` replies from distinct
/// replicas bearing the same result.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Reply {
    pub replica: ReplicaId,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub client: ClientId,
    pub timestamp: Timestamp,
    pub result: Vec<u8>,
    pub signature: SignatureBytes,
}

impl Reply {
    pub fn new(
        keypair: &Keypair,
        replica: ReplicaId,
        view: ViewNumber,
        seq: SequenceNumber,
        client: ClientId,
        timestamp: Timestamp,
        result: Vec<u8>,
    ) -> Reply {
        let signature = keypair.sign(&reply_bytes(&replica, &view, &seq, &client, &timestamp, &result));
        Reply {
            replica,
            view,
            seq,
            client,
            timestamp,
            result,
            signature,
        }
    }
}

impl SignedMessage for Reply {
    fn message_bytes(&self) -> Vec<u8> {
        reply_bytes(
            &self.replica,
            &self.view,
            &self.seq,
            &self.client,
            &self.timestamp,
            &self.result,
        )
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

fn reply_bytes(
    replica: &ReplicaId,
    view: &ViewNumber,
    seq: &SequenceNumber,
    client: &ClientId,
    timestamp: &Timestamp,
    result: &[u8],
) -> Vec<u8> {
    ("REPLY", replica, view, seq, client, timestamp, result)
        .try_to_vec()
        .unwrap()
}

/// Messages exchanged between replicas as part of three-phase agreement.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum PbftMessage {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Forward(Forward),
}

impl PbftMessage {
    pub fn sender(&self) -> ReplicaId {
        match self {
            PbftMessage::PrePrepare(msg) => msg.replica,
            PbftMessage::Prepare(msg) => msg.replica,
            PbftMessage::Commit(msg) => msg.replica,
            PbftMessage::Forward(msg) => msg.replica,
        }
    }

    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            PbftMessage::PrePrepare(msg) => Some(msg.view),
            PbftMessage::Prepare(msg) => Some(msg.view),
            PbftMessage::Commit(msg) => Some(msg.view),
            PbftMessage::Forward(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;

    fn keypair(seed: u8) -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[seed; 32]))
    }

    fn request() -> ClientRequest {
        ClientRequest::new(
            ClientId::new("c1".to_string()),
            Timestamp::new(1),
            b"hello".to_vec(),
        )
    }

    #[test]
    fn digest_ignores_forwarded_flag() {
        let original = request();
        let mut forwarded = original.clone();
        forwarded.forwarded = true;
        assert_eq!(original.digest(), forwarded.digest());
    }

    #[test]
    fn digest_distinguishes_payloads() {
        let a = request();
        let mut b = request();
        b.payload = b"world".to_vec();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn signed_messages_verify_under_the_signers_key() {
        let kp = keypair(1);
        let pre_prepare = PrePrepare::new(
            &kp,
            ReplicaId::new(0),
            ViewNumber::init(),
            SequenceNumber::init(),
            request(),
        );
        assert!(pre_prepare.is_correct(&kp.public()));

        let prepare = Prepare::new(
            &kp,
            ReplicaId::new(1),
            ViewNumber::init(),
            SequenceNumber::init(),
            request().digest(),
        );
        assert!(prepare.is_correct(&kp.public()));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let kp = keypair(1);
        let other = keypair(2);
        let mut prepare = Prepare::new(
            &kp,
            ReplicaId::new(1),
            ViewNumber::init(),
            SequenceNumber::init(),
            request().digest(),
        );

        // Verifying under a different key fails.
        assert!(!prepare.is_correct(&other.public()));

        // Tampering with a signed field after signing fails verification.
        prepare.seq = SequenceNumber::new(7);
        assert!(!prepare.is_correct(&kp.public()));
    }
}
