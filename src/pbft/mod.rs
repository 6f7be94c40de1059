/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The three-phase agreement subprotocol: PRE-PREPARE, PREPARE, and COMMIT.
//!
//! ## Happy path
//!
//! A client request reaches the primary of the current view (forwarded by a backup if need be).
//! The primary assigns it the next sequence number and broadcasts a PRE-PREPARE. Each backup
//! that accepts the PRE-PREPARE broadcasts a PREPARE. A replica that holds the PRE-PREPARE plus
//! `2f` matching PREPAREs becomes *prepared* for the slot and broadcasts a COMMIT. A prepared
//! replica that holds `2f + 1` matching COMMITs (its own included) becomes *committed-local*,
//! and executes the slot once every lower sequence number has executed.
//!
//! Per `(view, seq)` slot the states are `empty → pre_prepared → prepared → committed_local →
//! executed`, and transitions are monotonic within a view. A slot can only be abandoned by a
//! view advance.

pub mod messages;

pub mod roles;

pub(crate) mod protocol;
