/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Threads that establish and re-establish connections between replicas.
//!
//! Between every pair of replicas exactly one of the two initiates: the replica with the lower
//! id connects out to the higher id, and the higher id accepts. This keeps the mesh free of
//! duplicate connections without any negotiation. The initiator retries dead or missing
//! connections forever, so reconnection after a crash or partition is transparent to the
//! protocol.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use indexmap::IndexSet;
use rand::Rng;

use crate::ipc::manager::Shared;
use crate::ipc::stream::Stream;
use crate::ipc::{OBSERVER_CONNECTION_TAG, PEER_CONNECTION_TAG};
use crate::observer;
use crate::observer::ObserverContext;
use crate::types::basic::ReplicaId;

/// Spawn the listener thread: accepts incoming connections on the replica's socket and routes
/// them by their connection tag, peer handshakes to the connection map and observer connections
/// to their own serving threads.
pub(crate) fn start_listener(
    shared: Arc<Shared>,
    listener: TcpListener,
    observer_context: ObserverContext,
) {
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut tcp_stream = match stream {
                Ok(tcp_stream) => tcp_stream,
                Err(_) => continue,
            };

            let mut tag = [0u8; 1];
            if tcp_stream.read_exact(&mut tag).is_err() {
                continue;
            }

            match tag[0] {
                PEER_CONNECTION_TAG => {
                    let mut id_buf = [0u8; 4];
                    if tcp_stream.read_exact(&mut id_buf).is_err() {
                        continue;
                    }
                    let peer = ReplicaId::new(u32::from_le_bytes(id_buf));

                    // Only accept peers we know, and only from the initiating side of the pair.
                    if !shared.replica_set.contains(&peer) || peer >= shared.me {
                        continue;
                    }

                    register(&shared, peer, tcp_stream);
                }

                OBSERVER_CONNECTION_TAG => {
                    let context = observer_context.clone();
                    thread::spawn(move || observer::serve_connection(tcp_stream, context));
                }

                _ => continue,
            }
        }
    });
}

/// Spawn the initiator thread: keeps trying to connect to every peer with a higher id than ours
/// that has no live connection, picking a random pending target each round.
pub(crate) fn start_initiator(shared: Arc<Shared>) {
    thread::spawn(move || {
        let mut rng = rand::thread_rng();
        loop {
            // 1. Collect the targets we are responsible for that currently lack a live stream.
            let pending: IndexSet<ReplicaId> = {
                let conns = shared.conns.read().unwrap();
                shared
                    .replica_set
                    .ids()
                    .filter(|id| *id > shared.me)
                    .filter(|id| conns.get(id).map_or(true, |stream| !stream.is_alive()))
                    .collect()
            };

            if pending.is_empty() {
                thread::sleep(shared.config.reconnect_interval);
                continue;
            }

            // 2. Pick a random pending target and attempt to establish a stream to it.
            let target = *pending
                .get_index(rng.gen_range(0..pending.len()))
                .unwrap();
            let addr = match shared.config.peer_addrs.get(&target) {
                Some(addr) => *addr,
                None => {
                    thread::sleep(shared.config.reconnect_interval);
                    continue;
                }
            };

            if let Some(tcp_stream) = connect(&shared, addr) {
                register(&shared, target, tcp_stream);
            } else {
                thread::sleep(shared.config.reconnect_interval);
            }
        }
    });
}

/// One connection attempt: dial, then identify ourselves with the peer handshake.
fn connect(shared: &Arc<Shared>, addr: SocketAddr) -> Option<TcpStream> {
    let mut tcp_stream =
        TcpStream::connect_timeout(&addr, shared.config.initiator_timeout).ok()?;

    let mut handshake = [0u8; 5];
    handshake[0] = PEER_CONNECTION_TAG;
    handshake[1..].copy_from_slice(&shared.me.int().to_le_bytes());
    tcp_stream.write_all(&handshake).ok()?;

    Some(tcp_stream)
}

/// Wrap an established socket in a [Stream] and put it into the connection map, replacing any
/// dead predecessor.
fn register(shared: &Arc<Shared>, peer: ReplicaId, tcp_stream: TcpStream) {
    match Stream::start(
        tcp_stream,
        peer,
        shared.inbox_sender.clone(),
        shared.config.writer_channel_buffer_len,
    ) {
        Ok(stream) => {
            shared.conns.write().unwrap().insert(peer, stream);
        }
        Err(_) => (),
    }
}
