/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them when building the
//! replica's [event handlers](crate::event_bus::EventHandlers).
//!
//! PBFT-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [ReceivePrepare](crate::events::ReceivePrepareEvent) is printed:
//!
//! ```text
//! ReceivePrepare, 1701329264, 2, 0, 0, Id5u7f6
//! ```
//!
//! In the snippet, the third value is the id of the origin replica, the fourth and fifth are the
//! view and sequence number, and the sixth is the first seven characters of the Base64 encoding
//! of the digest.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const RECEIVE_REQUEST: &str = "ReceiveRequest";
pub const FORWARD_REQUEST: &str = "ForwardRequest";

pub const PRE_PREPARE: &str = "PrePrepare";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";

pub const RECEIVE_PRE_PREPARE: &str = "ReceivePrePrepare";
pub const RECEIVE_PREPARE: &str = "ReceivePrepare";
pub const RECEIVE_COMMIT: &str = "ReceiveCommit";

pub const PREPARED: &str = "Prepared";
pub const COMMITTED: &str = "Committed";
pub const EXECUTE: &str = "Execute";

pub const EQUIVOCATION: &str = "Equivocation";
pub const VIEW_TIMEOUT: &str = "ViewTimeout";
pub const SET_VIEW: &str = "SetView";
pub const RECEIVE_SET_VIEW: &str = "ReceiveSetView";
pub const START_VIEW: &str = "StartView";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ReceiveRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_REQUEST,
                secs_since_unix_epoch(event.timestamp),
                event.request.client,
                event.request.timestamp,
                first_seven_base64_chars(&event.request.digest().bytes()),
            )
        })
    }
}

impl Logger for ForwardRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ForwardRequestEvent| {
            log::info!(
                "{}, {}, {}, {}",
                FORWARD_REQUEST,
                secs_since_unix_epoch(event.timestamp),
                event.primary,
                first_seven_base64_chars(&event.request.digest().bytes()),
            )
        })
    }
}

impl Logger for PrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PRE_PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.pre_prepare.view,
                event.pre_prepare.seq,
                first_seven_base64_chars(&event.pre_prepare.digest.bytes()),
            )
        })
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.prepare.view,
                event.prepare.seq,
                first_seven_base64_chars(&event.prepare.digest.bytes()),
            )
        })
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(event.timestamp),
                event.commit.view,
                event.commit.seq,
                first_seven_base64_chars(&event.commit.digest.bytes()),
            )
        })
    }
}

impl Logger for ReceivePrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceivePrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PRE_PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.pre_prepare.view,
                event.pre_prepare.seq,
                first_seven_base64_chars(&event.pre_prepare.digest.bytes()),
            )
        })
    }
}

impl Logger for ReceivePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceivePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PREPARE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.prepare.view,
                event.prepare.seq,
                first_seven_base64_chars(&event.prepare.digest.bytes()),
            )
        })
    }
}

impl Logger for ReceiveCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveCommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_COMMIT,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.commit.view,
                event.commit.seq,
                first_seven_base64_chars(&event.commit.digest.bytes()),
            )
        })
    }
}

impl Logger for PreparedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PreparedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                PREPARED,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event.seq,
                first_seven_base64_chars(&event.digest.bytes()),
                event.prepares,
            )
        })
    }
}

impl Logger for CommittedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommittedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COMMITTED,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event.seq,
                first_seven_base64_chars(&event.digest.bytes()),
                event.commits,
            )
        })
    }
}

impl Logger for ExecuteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ExecuteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                EXECUTE,
                secs_since_unix_epoch(event.timestamp),
                event.seq,
                event.reply.client,
                event.reply.timestamp,
            )
        })
    }
}

impl Logger for EquivocationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &EquivocationEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}, {}",
                EQUIVOCATION,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event.seq,
                first_seven_base64_chars(&event.accepted.bytes()),
                event
                    .conflicting
                    .map(|digest| first_seven_base64_chars(&digest.bytes()))
                    .unwrap_or_default(),
            )
        })
    }
}

impl Logger for ViewTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewTimeoutEvent| {
            log::warn!(
                "{}, {}, {}",
                VIEW_TIMEOUT,
                secs_since_unix_epoch(event.timestamp),
                event.view,
            )
        })
    }
}

impl Logger for SetViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SetViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SET_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.set_view.view,
                event.set_view.reason,
            )
        })
    }
}

impl Logger for ReceiveSetViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveSetViewEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_SET_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.set_view.view,
                event.set_view.reason,
            )
        })
    }
}

impl Logger for StartViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event.primary,
            )
        })
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
