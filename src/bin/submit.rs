/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Submit a client request to a running PBFT-rs cluster and wait for the reply.
//!
//! ```text
//! submit --addr 127.0.0.1:5001 --payload "hello"
//! ```
//!
//! The request is submitted through the observer surface of the addressed replica, which either
//! orders it directly (if it is the primary) or forwards it. The tool then polls for the reply,
//! re-submitting whenever the client timeout elapses without one; a replica never answers a
//! well-formed request with an error, so giving up is purely the client's decision.

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use clap::Parser;

use pbft_rs::observer::ObserverClient;
use pbft_rs::pbft::messages::ClientRequest;
use pbft_rs::types::basic::{ClientId, Timestamp};

/// How often the tool polls the reply cache between submissions.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(about = "Submit a request to a PBFT cluster")]
struct Args {
    /// host:port of any replica.
    #[arg(long)]
    addr: String,

    /// The request payload.
    #[arg(long)]
    payload: String,

    /// Client id the request is submitted under.
    #[arg(long, default_value = "cli")]
    client_id: String,

    /// Re-submission interval: how long to wait for a reply before submitting again.
    #[arg(long, default_value_t = 5000)]
    client_timeout_ms: u64,

    /// Give up after this long without a reply.
    #[arg(long, default_value_t = 30000)]
    max_wait_ms: u64,
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

    let client = ClientId::new(args.client_id.clone());
    let timestamp = Timestamp::new(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64,
    );
    let request = ClientRequest::new(client.clone(), timestamp, args.payload.into_bytes());

    let connect_timeout = Duration::from_millis(args.client_timeout_ms);
    let mut observer = match ObserverClient::connect(&args.addr, connect_timeout) {
        Ok(observer) => observer,
        Err(err) => {
            eprintln!("could not connect to {}: {}", args.addr, err);
            return ExitCode::from(1);
        }
    };

    let deadline = Instant::now() + Duration::from_millis(args.max_wait_ms);
    let client_timeout = Duration::from_millis(args.client_timeout_ms);

    while Instant::now() < deadline {
        // (Re-)submit. Duplicate submissions are safe: the cluster executes a given
        // (client, timestamp) at most once and answers repeats from its reply cache.
        match observer.submit_request(request.clone()) {
            Ok((accepted, forwarded_to)) => match forwarded_to {
                Some(primary) => eprintln!("submitted, forwarded to primary {}", primary),
                None if accepted => eprintln!("submitted"),
                None => eprintln!("not accepted, retrying"),
            },
            Err(err) => eprintln!("submission failed: {}", err),
        }

        // Poll for the reply until the client timeout elapses, then re-submit.
        let resubmit_at = Instant::now() + client_timeout;
        while Instant::now() < resubmit_at && Instant::now() < deadline {
            match observer.get_reply(client.clone(), timestamp) {
                Ok(Some(reply)) => {
                    println!(
                        "reply from replica {}: seq = {}, result = {:?}",
                        reply.replica,
                        reply.seq,
                        String::from_utf8_lossy(&reply.result),
                    );
                    return ExitCode::SUCCESS;
                }
                Ok(None) => (),
                Err(err) => eprintln!("poll failed: {}", err),
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    eprintln!("no reply within {} ms", args.max_wait_ms);
    ExitCode::from(1)
}
