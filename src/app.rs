/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [App] trait: the interface between the protocol and the replicated application.

use crate::pbft::messages::ClientRequest;

/// The application state machine that committed requests are applied to.
///
/// Implementations are called exactly once per committed request, in ascending contiguous
/// sequence-number order, from the algorithm thread. The returned bytes become the `result` field
/// of the REPLY to the client. Applications must be deterministic: every honest replica applies
/// the same requests in the same order, and clients cross-check results across `f + 1` replies.
pub trait App: Send + 'static {
    fn apply(&mut self, request: &ClientRequest) -> Vec<u8>;
}

/// The demo application: echoes each request's payload back to the client.
pub struct EchoApp;

impl App for EchoApp {
    fn apply(&mut self, request: &ClientRequest) -> Vec<u8> {
        request.payload.clone()
    }
}
