/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator. This is split up into smaller, subsystem specific
//! config structs before being passed to components.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::types::{
    basic::{BufferSize, ReplicaId},
    keypair::Keypair,
    replica_set::ReplicaSet,
};

#[derive(Clone)]
pub struct Configuration {
    pub identity: IdentityConfig,
    pub protocol: ProtocolConfig,
    pub networking: NetworkingConfiguration,
}

impl Configuration {
    /// Check the configuration for operator mistakes. A failure here is a startup rejection
    /// (process exit code 1).
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let n = self.identity.replica_set.n();
        let f = self.identity.replica_set.f();

        if f < 1 || n != 3 * f + 1 {
            return Err(ConfigurationError::InvalidClusterSize { n });
        }

        if !self.identity.replica_set.contains(&self.identity.me) {
            return Err(ConfigurationError::UnknownLocalReplica {
                me: self.identity.me,
            });
        }

        for id in self.identity.replica_set.ids() {
            if id != self.identity.me && !self.networking.peer_addrs.contains_key(&id) {
                return Err(ConfigurationError::MissingPeerAddress { peer: id });
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
pub struct IdentityConfig {
    pub me: ReplicaId,
    pub keypair: Keypair,
    pub replica_set: ReplicaSet,
}

#[derive(Clone)]
pub struct ProtocolConfig {
    /// Optional high/low watermark span for sequence numbers. `None` accepts any sequence
    /// number.
    pub seq_window: Option<u64>,

    /// How long a stalled in-flight slot is tolerated before the replica gives up on the
    /// current primary and advances the view.
    pub progress_timeout: Duration,

    /// Per-sender capacity of the future-view message buffer.
    pub message_buffer_capacity: BufferSize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            seq_window: None,
            progress_timeout: Duration::from_millis(2000),
            message_buffer_capacity: BufferSize::new(256),
        }
    }
}

#[derive(Clone)]
pub struct NetworkingConfiguration {
    pub listening_addr: IpAddr,
    pub listening_port: u16,

    /// Transport address of every other member of the replica set.
    pub peer_addrs: HashMap<ReplicaId, SocketAddr>,

    /// How long one connection attempt to a peer may take.
    pub initiator_timeout: Duration,

    /// How long the initiator sleeps between rounds of connection attempts.
    pub reconnect_interval: Duration,

    /// Bound of the per-connection writer queue. Sends block while it is full.
    pub writer_channel_buffer_len: usize,
}

/// The ways a [Configuration] can be rejected at startup.
#[derive(Debug)]
pub enum ConfigurationError {
    /// The replica set size does not satisfy `n = 3f + 1` for some `f >= 1`.
    InvalidClusterSize { n: usize },
    /// The local replica id is not a member of the replica set.
    UnknownLocalReplica { me: ReplicaId },
    /// A member of the replica set has no transport address.
    MissingPeerAddress { peer: ReplicaId },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::InvalidClusterSize { n } => {
                write!(f, "cluster size {} does not satisfy n = 3f + 1 for f >= 1", n)
            }
            ConfigurationError::UnknownLocalReplica { me } => {
                write!(f, "local replica id {} is not in the replica set", me)
            }
            ConfigurationError::MissingPeerAddress { peer } => {
                write!(f, "replica {} has no transport address", peer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;

    fn configuration(n: u32) -> Configuration {
        let members: Vec<_> = (0..n)
            .map(|id| {
                let key = SigningKey::from_bytes(&[id as u8; 32]);
                (ReplicaId::new(id), key.verifying_key())
            })
            .collect();
        let peer_addrs = (1..n)
            .map(|id| {
                (
                    ReplicaId::new(id),
                    format!("127.0.0.1:{}", 7000 + id).parse().unwrap(),
                )
            })
            .collect();

        Configuration {
            identity: IdentityConfig {
                me: ReplicaId::new(0),
                keypair: Keypair::new(SigningKey::from_bytes(&[0; 32])),
                replica_set: ReplicaSet::new(members),
            },
            protocol: ProtocolConfig::default(),
            networking: NetworkingConfiguration {
                listening_addr: "127.0.0.1".parse().unwrap(),
                listening_port: 7000,
                peer_addrs,
                initiator_timeout: Duration::from_millis(500),
                reconnect_interval: Duration::from_millis(500),
                writer_channel_buffer_len: 1024,
            },
        }
    }

    #[test]
    fn four_replicas_validate() {
        assert!(configuration(4).validate().is_ok());
    }

    #[test]
    fn n_equal_three_f_is_rejected() {
        // n = 3 is 3f with f = 1: one short of tolerating a single fault.
        assert!(matches!(
            configuration(3).validate(),
            Err(ConfigurationError::InvalidClusterSize { n: 3 })
        ));
        assert!(matches!(
            configuration(6).validate(),
            Err(ConfigurationError::InvalidClusterSize { n: 6 })
        ));
    }

    #[test]
    fn missing_peer_address_is_rejected() {
        let mut config = configuration(4);
        config.networking.peer_addrs.remove(&ReplicaId::new(3));
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingPeerAddress { .. })
        ));
    }
}
