/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The test suite for PBFT-rs runs clusters of in-process replicas over a mock channel network
//! ([NetworkStub]) with the demo echo application, and drives them the way external clients
//! would: submitting requests, then polling replica status and the shared client inbox.
//!
//! The [TestHarness] is wired into the same mesh as the replicas, which lets a test play a
//! Byzantine member of the replica set: delivering conflicting PRE-PREPAREs, or messages with
//! forged authenticators, without any fault-injection conditionals inside the protocol itself.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use log::LevelFilter;

use pbft_rs::observer::Role;
use pbft_rs::pbft::messages::{ClientRequest, PrePrepare, Prepare};
use pbft_rs::types::basic::{ClientId, ReplicaId, SequenceNumber, Timestamp, ViewNumber};

use common::gateway::ReplyInbox;
use common::logging::setup_logger;
use common::network::{mock_network, TestHarness};
use common::node::{keypair, replica_set, Node};

/// A cluster of four in-process replicas (f = 1), with only the listed ids actually started.
/// Unstarted ids stay in the replica set but never process a message, which is exactly a
/// crashed replica.
fn cluster(
    ids_to_start: &[u32],
    progress_timeout: Duration,
) -> (Vec<Node>, TestHarness, ReplyInbox) {
    setup_logger(LevelFilter::Info);

    let replica_set = replica_set(4);
    let (stubs, harness) = mock_network(replica_set.ids());
    let inbox = ReplyInbox::new();

    // The i-th stub belongs to replica i; unstarted replicas' stubs are simply dropped.
    let mut stubs: Vec<Option<common::network::NetworkStub>> =
        stubs.into_iter().map(Some).collect();
    let nodes = ids_to_start
        .iter()
        .map(|id| {
            Node::new(
                *id,
                stubs[*id as usize].take().unwrap(),
                inbox.clone(),
                replica_set.clone(),
                progress_timeout,
            )
        })
        .collect();

    (nodes, harness, inbox)
}

/// Poll `condition` every 100 ms until it holds, panicking after `secs` seconds.
fn wait_until(secs: u64, what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        thread::sleep(Duration::from_millis(100));
    }
}

const CALM: Duration = Duration::from_secs(30);

#[test]
fn happy_path_all_replicas_execute_and_reply() {
    let (nodes, _, inbox) = cluster(&[0, 1, 2, 3], CALM);

    // The client sends ("c1", 1, "hello") to replica 0, the primary of view 0.
    assert_eq!(nodes[0].status().role, Role::Primary);
    nodes[0].submit("c1", 1, b"hello");

    // All four replicas execute seq 0.
    wait_until(10, "all four replicas execute seq 0", || {
        nodes.iter().all(|node| node.last_executed() == Some(0))
    });

    // The client sees four replies bearing identical results, one per replica.
    wait_until(10, "four matching replies", || {
        inbox.matching_replicas("c1", 1, b"hello") == 4
    });
}

#[test]
fn request_submitted_to_a_backup_is_forwarded_to_the_primary() {
    let (nodes, _, inbox) = cluster(&[0, 1, 2, 3], CALM);

    // Same request, but submitted to replica 2, a backup. It forwards to replica 0 and assigns
    // no sequence number of its own; the outcome is identical to submitting at the primary.
    assert_eq!(nodes[2].status().role, Role::Backup);
    nodes[2].submit("c1", 1, b"hello");

    wait_until(10, "all four replicas execute seq 0", || {
        nodes.iter().all(|node| node.last_executed() == Some(0))
    });
    wait_until(10, "four matching replies", || {
        inbox.matching_replicas("c1", 1, b"hello") == 4
    });
}

#[test]
fn cluster_survives_one_crashed_backup() {
    // Replica 3 is a member of the replica set but is down before start.
    let (nodes, _, inbox) = cluster(&[0, 1, 2], CALM);

    nodes[0].submit("c1", 1, b"hello");

    // The three live replicas collect 2f = 2 PREPAREs and 2f + 1 = 3 COMMITs and execute.
    wait_until(10, "three live replicas execute seq 0", || {
        nodes.iter().all(|node| node.last_executed() == Some(0))
    });

    // The client observes at least f + 1 = 2 matching replies.
    assert!(inbox.matching_replicas("c1", 1, b"hello") >= 2);
}

#[test]
fn equivocating_primary_commits_nothing_and_is_rotated_out() {
    // Replicas 1, 2 and 3 are honest; the harness plays replica 0, the primary of view 0.
    let (nodes, harness, inbox) = cluster(&[1, 2, 3], Duration::from_millis(500));

    let request_a = ClientRequest::new(ClientId::new("c1".into()), Timestamp::new(1), b"a".to_vec());
    let request_b = ClientRequest::new(ClientId::new("c1".into()), Timestamp::new(1), b"b".to_vec());

    // The Byzantine primary sends PRE-PREPARE(v=0, seq=0, d1) to replica 1 and a conflicting
    // PRE-PREPARE(v=0, seq=0, d2 != d1) to replica 2.
    let pp_a = PrePrepare::new(
        &keypair(0),
        ReplicaId::new(0),
        ViewNumber::init(),
        SequenceNumber::init(),
        request_a,
    );
    let pp_b = PrePrepare::new(
        &keypair(0),
        ReplicaId::new(0),
        ViewNumber::init(),
        SequenceNumber::init(),
        request_b,
    );
    harness.send_as(ReplicaId::new(0), ReplicaId::new(1), pp_a.into());
    harness.send_as(ReplicaId::new(0), ReplicaId::new(2), pp_b.into());

    // The conflict surfaces in the PREPARE exchange: neither digest can gather 2f matching
    // PREPAREs, so nothing prepares, commits, or executes.
    thread::sleep(Duration::from_secs(2));
    for node in &nodes {
        assert_eq!(node.last_executed(), None);
        assert_eq!(node.status().prepared_slots, 0);
        assert_eq!(node.status().committed_slots, 0);
    }
    assert!(inbox.replies_for("c1", 1).is_empty());

    // The progress timer fires on the stalled replicas and the cluster rotates past the faulty
    // primary.
    wait_until(10, "every replica moves past view 0", || {
        nodes.iter().all(|node| node.view() >= 1)
    });
}

#[test]
fn duplicate_client_request_executes_once() {
    let (nodes, _, inbox) = cluster(&[0, 1, 2, 3], CALM);

    nodes[0].submit("c1", 7, b"hello");
    wait_until(10, "all four replicas execute seq 0", || {
        nodes.iter().all(|node| node.last_executed() == Some(0))
    });
    let replies_after_first = inbox.replies_for("c1", 7).len();

    // The client re-sends the same request with the same timestamp. The primary answers from
    // its reply cache: no re-execution, no new log entry, last_executed advances by exactly 0.
    nodes[0].submit("c1", 7, b"hello");
    wait_until(10, "the cached reply is re-sent", || {
        inbox.replies_for("c1", 7).len() > replies_after_first
    });

    thread::sleep(Duration::from_millis(500));
    for node in &nodes {
        assert_eq!(node.last_executed(), Some(0));
        assert_eq!(node.status().committed_slots, 1);
    }

    // A fresh request afterwards lands at seq 1: the duplicate consumed no sequence number.
    nodes[0].submit("c1", 8, b"again");
    wait_until(10, "the follow-up request executes at seq 1", || {
        nodes.iter().all(|node| node.last_executed() == Some(1))
    });
}

#[test]
fn forged_authenticators_are_dropped_and_counted() {
    let (nodes, harness, _) = cluster(&[0, 1, 2, 3], CALM);

    // A PREPARE signed with replica 3's key but claiming to come from replica 2.
    let digest = ClientRequest::new(ClientId::new("c1".into()), Timestamp::new(1), b"x".to_vec())
        .digest();
    let forged = Prepare::new(
        &keypair(3),
        ReplicaId::new(2),
        ViewNumber::init(),
        SequenceNumber::init(),
        digest,
    );
    harness.send_as(ReplicaId::new(2), ReplicaId::new(0), forged.into());

    wait_until(10, "the forgery is counted at replica 0", || {
        nodes[0].status().auth_rejections >= 1
    });

    // The forged vote changed nothing.
    assert_eq!(nodes[0].status().prepared_slots, 0);
    assert_eq!(nodes[0].last_executed(), None);

    // A message from outside the replica set is dropped without being counted as an
    // authentication failure.
    let unknown = Prepare::new(
        &keypair(9),
        ReplicaId::new(9),
        ViewNumber::init(),
        SequenceNumber::init(),
        digest,
    );
    harness.send_as(ReplicaId::new(9), ReplicaId::new(0), unknown.into());
    thread::sleep(Duration::from_millis(500));
    assert_eq!(nodes[0].status().auth_rejections, 1);
}
