/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The observer surface: read-only status queries and client request submission for external
//! tools.
//!
//! Observer connections share the replica's listening socket with peer connections (they are
//! distinguished by a connection tag byte, see [ipc](crate::ipc)), but the observer path is
//! strictly outside the quorum: it neither sends nor receives protocol messages. Status queries
//! are served from a [snapshot](StatusCamera) refreshed by the algorithm thread, and submissions
//! enter the algorithm thread through a channel.
//!
//! The wire protocol is one borsh [ObserverRequest] frame per request, answered by one
//! [ObserverResponse] frame.

use std::collections::HashMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::ipc::stream::{read_frame, write_frame};
use crate::ipc::OBSERVER_CONNECTION_TAG;
use crate::networking::ClientGateway;
use crate::pbft::messages::{ClientRequest, Reply};
use crate::pbft::protocol::Intake;
use crate::types::basic::{ClientId, ReplicaId, SequenceNumber, Timestamp, ViewNumber};
use crate::types::replica_set::ReplicaSet;

/// How long a submission waits for the algorithm thread to acknowledge intake before the
/// observer reports it as not accepted.
const SUBMIT_OUTCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests external tools can make of a replica.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum ObserverRequest {
    GetStatus,
    SubmitRequest(ClientRequest),
    GetReply { client: ClientId, timestamp: Timestamp },
    Ping,
    KillNode,
}

/// Responses to [ObserverRequest]s.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum ObserverResponse {
    Status(Status),
    Submitted {
        accepted: bool,
        forwarded_to: Option<ReplicaId>,
    },
    Reply(Option<Reply>),
    Pong,
    Killed,
}

/// A point-in-time summary of one replica's protocol state.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Status {
    pub replica: ReplicaId,
    pub role: Role,
    pub view: ViewNumber,
    pub primary: ReplicaId,
    pub f: u32,
    pub n: u32,
    pub last_executed: Option<SequenceNumber>,
    pub prepared_slots: u64,
    pub committed_slots: u64,
    pub auth_rejections: u64,
}

impl Status {
    /// The status of a freshly started replica: view 0, nothing executed.
    pub fn initial(replica: ReplicaId, replica_set: &ReplicaSet) -> Status {
        let view = ViewNumber::init();
        let primary = replica_set.primary(view);
        Status {
            replica,
            role: if primary == replica {
                Role::Primary
            } else {
                Role::Backup
            },
            view,
            primary,
            f: replica_set.f() as u32,
            n: replica_set.n() as u32,
            last_executed: None,
            prepared_slots: 0,
            committed_slots: 0,
            auth_rejections: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum Role {
    Primary,
    Backup,
}

/// A shared handle onto the latest [Status] snapshot. The algorithm thread
/// [updates](Self::update) it after processing each event; observer connections read it without
/// touching protocol state.
#[derive(Clone)]
pub struct StatusCamera {
    inner: Arc<Mutex<Status>>,
}

impl StatusCamera {
    pub fn new(initial: Status) -> StatusCamera {
        StatusCamera {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Status {
        self.inner.lock().unwrap().clone()
    }

    pub(crate) fn update(&self, status: Status) {
        *self.inner.lock().unwrap() = status;
    }
}

/// A work item for the algorithm thread: a client request, plus an optional channel on which the
/// intake decision is reported back to the submitting observer connection.
pub struct SubmitJob {
    pub(crate) request: ClientRequest,
    pub(crate) outcome: Option<Sender<Intake>>,
}

/// The sending half of the submission channel into the algorithm thread.
#[derive(Clone)]
pub struct SubmitHandle {
    sender: Sender<SubmitJob>,
}

impl SubmitHandle {
    /// Submit a request without waiting for the intake decision.
    pub fn submit(&self, request: ClientRequest) {
        let _ = self.sender.send(SubmitJob {
            request,
            outcome: None,
        });
    }

    pub(crate) fn submit_with_outcome(&self, request: ClientRequest, outcome: Sender<Intake>) {
        let _ = self.sender.send(SubmitJob {
            request,
            outcome: Some(outcome),
        });
    }
}

/// Create the submission channel whose receiving half is drained by the algorithm thread.
pub fn submit_channel() -> (SubmitHandle, Receiver<SubmitJob>) {
    let (sender, receiver) = mpsc::channel();
    (SubmitHandle { sender }, receiver)
}

/// Retains the latest [Reply] per `(client, timestamp)` so observer connections can collect
/// results, and doubles as the [ClientGateway] of the TCP build.
///
/// This mirrors the reply cache inside the replica log, but lives outside the algorithm thread:
/// it is the camera through which clients see their replies without the observer path touching
/// protocol state.
#[derive(Clone)]
pub struct ClientRegistry {
    replies: Arc<Mutex<HashMap<(ClientId, Timestamp), Reply>>>,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry {
            replies: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn reply(&self, client: &ClientId, timestamp: Timestamp) -> Option<Reply> {
        self.replies
            .lock()
            .unwrap()
            .get(&(client.clone(), timestamp))
            .cloned()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        ClientRegistry::new()
    }
}

impl ClientGateway for ClientRegistry {
    fn send_reply(&mut self, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert((reply.client.clone(), reply.timestamp), reply);
    }
}

/// Everything an observer connection needs to answer requests. Cheap to clone; one clone is
/// handed to each accepted observer connection.
#[derive(Clone)]
pub struct ObserverContext {
    pub submit: SubmitHandle,
    pub camera: StatusCamera,
    pub registry: ClientRegistry,
    pub kill: Sender<()>,
}

/// Serve one observer connection until it closes or asks the replica to die.
pub(crate) fn serve_connection(mut tcp_stream: TcpStream, context: ObserverContext) {
    loop {
        let request: ObserverRequest = match read_frame(&mut tcp_stream) {
            Ok(request) => request,
            Err(_) => return,
        };

        let response = match request {
            ObserverRequest::GetStatus => ObserverResponse::Status(context.camera.snapshot()),

            ObserverRequest::SubmitRequest(client_request) => {
                let (outcome_sender, outcome_receiver) = mpsc::channel();
                context
                    .submit
                    .submit_with_outcome(client_request, outcome_sender);

                match outcome_receiver.recv_timeout(SUBMIT_OUTCOME_TIMEOUT) {
                    Ok(intake) => ObserverResponse::Submitted {
                        accepted: intake.accepted,
                        forwarded_to: intake.forwarded_to,
                    },
                    Err(_) => ObserverResponse::Submitted {
                        accepted: false,
                        forwarded_to: None,
                    },
                }
            }

            ObserverRequest::GetReply { client, timestamp } => {
                ObserverResponse::Reply(context.registry.reply(&client, timestamp))
            }

            ObserverRequest::Ping => ObserverResponse::Pong,

            ObserverRequest::KillNode => {
                let _ = context.kill.send(());
                let _ = write_frame(&mut tcp_stream, &ObserverResponse::Killed);
                return;
            }
        };

        if write_frame(&mut tcp_stream, &response).is_err() {
            return;
        }
    }
}

/// Client side of the observer protocol, used by external tools (and the `submit` binary) to
/// talk to a running replica.
pub struct ObserverClient {
    stream: TcpStream,
}

impl ObserverClient {
    /// Connect to the replica listening at `addr` and identify this connection as an observer.
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<ObserverClient> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        use std::io::Write;
        stream.write_all(&[OBSERVER_CONNECTION_TAG])?;

        Ok(ObserverClient { stream })
    }

    pub fn get_status(&mut self) -> io::Result<Status> {
        match self.request(&ObserverRequest::GetStatus)? {
            ObserverResponse::Status(status) => Ok(status),
            _ => Err(unexpected_response()),
        }
    }

    pub fn submit_request(
        &mut self,
        request: ClientRequest,
    ) -> io::Result<(bool, Option<ReplicaId>)> {
        match self.request(&ObserverRequest::SubmitRequest(request))? {
            ObserverResponse::Submitted {
                accepted,
                forwarded_to,
            } => Ok((accepted, forwarded_to)),
            _ => Err(unexpected_response()),
        }
    }

    pub fn get_reply(
        &mut self,
        client: ClientId,
        timestamp: Timestamp,
    ) -> io::Result<Option<Reply>> {
        match self.request(&ObserverRequest::GetReply { client, timestamp })? {
            ObserverResponse::Reply(reply) => Ok(reply),
            _ => Err(unexpected_response()),
        }
    }

    pub fn ping(&mut self) -> io::Result<()> {
        match self.request(&ObserverRequest::Ping)? {
            ObserverResponse::Pong => Ok(()),
            _ => Err(unexpected_response()),
        }
    }

    pub fn kill_node(&mut self) -> io::Result<()> {
        match self.request(&ObserverRequest::KillNode)? {
            ObserverResponse::Killed => Ok(()),
            _ => Err(unexpected_response()),
        }
    }

    fn request(&mut self, request: &ObserverRequest) -> io::Result<ObserverResponse> {
        write_frame(&mut self.stream, request)?;
        read_frame(&mut self.stream)
    }
}

fn unexpected_response() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "unexpected observer response")
}
