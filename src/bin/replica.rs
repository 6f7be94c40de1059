/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Start one replica process of a PBFT-rs cluster.
//!
//! ```text
//! replica --id 0 --port 5001 --peers "0@127.0.0.1:5001,1@127.0.0.1:5002,2@127.0.0.1:5003,3@127.0.0.1:5004"
//! ```
//!
//! The peer list enumerates the full replica set, this replica included. Key material is derived
//! deterministically from replica ids, which lets every member of a static cluster know its
//! peers' public keys without any exchange. The process runs until it receives a KillNode
//! request on its observer surface.
//!
//! Exit codes: 0 normal shutdown, 1 configuration error, 2 transport bind failure, 3 internal
//! invariant violation.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use ed25519_dalek::SigningKey;
use log::LevelFilter;
use sha2::{Digest as Sha2Digest, Sha256};

use pbft_rs::config::{Configuration, IdentityConfig, NetworkingConfiguration, ProtocolConfig};
use pbft_rs::event_bus::EventHandlers;
use pbft_rs::ipc::PeerNetwork;
use pbft_rs::observer::{self, ClientRegistry, ObserverContext, Status, StatusCamera};
use pbft_rs::types::basic::{BufferSize, ReplicaId};
use pbft_rs::types::keypair::Keypair;
use pbft_rs::types::replica_set::ReplicaSet;
use pbft_rs::{EchoApp, Replica};

#[derive(Parser)]
#[command(about = "Start one replica of a PBFT cluster")]
struct Args {
    /// Id of this replica within the cluster.
    #[arg(long)]
    id: u32,

    /// Port this replica listens on for peers and observers.
    #[arg(long)]
    port: u16,

    /// Full replica set as a comma-separated list of id@host:port entries.
    #[arg(long)]
    peers: String,

    /// Maximum tolerated Byzantine faults. Derived from the peer count when omitted; when given,
    /// it must agree with the peer count.
    #[arg(long)]
    f: Option<u32>,

    /// Optional high/low watermark span for sequence numbers.
    #[arg(long)]
    seq_window: Option<u64>,

    /// How long a stalled slot is tolerated before this replica advances the view.
    #[arg(long, default_value_t = 2000)]
    replica_progress_timeout_ms: u64,

    /// Log level: off, error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.use_stderr() => {
            eprintln!("{}", err);
            return ExitCode::from(1);
        }
        Err(err) => {
            // --help and --version land here.
            print!("{}", err);
            return ExitCode::SUCCESS;
        }
    };

    setup_logger(args.log_level);

    let config = match configuration(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return ExitCode::from(1);
        }
    };

    let me = config.identity.me;
    let replica_set = config.identity.replica_set.clone();

    // Observer wiring: the submission channel into the algorithm thread, the status snapshot,
    // the reply registry, and the kill switch.
    let (submit_handle, submissions) = observer::submit_channel();
    let camera = StatusCamera::new(Status::initial(me, &replica_set));
    let registry = ClientRegistry::new();
    let (kill_sender, kill_receiver) = mpsc::channel();

    let observer_context = ObserverContext {
        submit: submit_handle.clone(),
        camera: camera.clone(),
        registry: registry.clone(),
        kill: kill_sender,
    };

    let network = match PeerNetwork::start(
        config.networking.clone(),
        me,
        replica_set,
        observer_context,
    ) {
        Ok(network) => network,
        Err(err) => {
            eprintln!("transport bind failure: {}", err);
            return ExitCode::from(2);
        }
    };

    log::info!(
        "replica {} listening on port {}, n = {}, f = {}",
        me,
        args.port,
        config.identity.replica_set.n(),
        config.identity.replica_set.f()
    );

    let replica = Replica::start(
        config,
        EchoApp,
        network,
        registry,
        submissions,
        submit_handle,
        camera,
        EventHandlers::logging_only(true),
    );

    // Block until an observer asks this replica to die.
    let _ = kill_receiver.recv();
    log::info!("replica {} shutting down", me);
    drop(replica);

    ExitCode::SUCCESS
}

/// Build the replica's [Configuration] from the command line.
fn configuration(args: &Args) -> Result<Configuration, String> {
    let mut members = Vec::new();
    let mut peer_addrs: HashMap<ReplicaId, SocketAddr> = HashMap::new();

    for entry in args.peers.split(',').filter(|entry| !entry.is_empty()) {
        let (id_part, addr_part) = entry
            .split_once('@')
            .ok_or_else(|| format!("bad peer entry {:?}: expected id@host:port", entry))?;
        let id: u32 = id_part
            .trim()
            .parse()
            .map_err(|_| format!("bad replica id {:?}", id_part))?;
        let addr: SocketAddr = addr_part
            .trim()
            .parse()
            .map_err(|_| format!("bad peer address {:?}", addr_part))?;

        let id = ReplicaId::new(id);
        members.push((id, keypair_for(id).public()));
        if id != ReplicaId::new(args.id) {
            peer_addrs.insert(id, addr);
        }
    }

    let replica_set = ReplicaSet::new(members);

    if let Some(f) = args.f {
        if f as usize != replica_set.f() {
            return Err(format!(
                "--f {} does not match the peer count: {} replicas tolerate f = {}",
                f,
                replica_set.n(),
                replica_set.f()
            ));
        }
    }

    let config = Configuration {
        identity: IdentityConfig {
            me: ReplicaId::new(args.id),
            keypair: keypair_for(ReplicaId::new(args.id)),
            replica_set,
        },
        protocol: ProtocolConfig {
            seq_window: args.seq_window,
            progress_timeout: Duration::from_millis(args.replica_progress_timeout_ms),
            message_buffer_capacity: BufferSize::new(256),
        },
        networking: NetworkingConfiguration {
            listening_addr: "0.0.0.0".parse().unwrap(),
            listening_port: args.port,
            peer_addrs,
            initiator_timeout: Duration::from_millis(500),
            reconnect_interval: Duration::from_millis(500),
            writer_channel_buffer_len: 1024,
        },
    };

    config.validate().map_err(|err| err.to_string())?;
    Ok(config)
}

/// Simulation-mode key material: each replica's signing key is derived from its id, so a static
/// cluster needs no key exchange.
fn keypair_for(id: ReplicaId) -> Keypair {
    let mut hasher = Sha256::new();
    hasher.update(b"pbft-rs simulation replica ");
    hasher.update(id.int().to_le_bytes());
    let seed: [u8; 32] = hasher.finalize().into();
    Keypair::new(SigningKey::from_bytes(&seed))
}

fn setup_logger(level: LevelFilter) {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .level(level)
        .chain(io::stdout())
        .apply()
        .unwrap();
}
