/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The algorithm thread: the single serialization point that owns a replica's mutable state.
//!
//! The thread is fed one event at a time — a submitted client request, an inbound message, or a
//! clock tick — and processes it to completion before taking the next. Messages are
//! authenticated here, before they reach the protocol: a message whose claimed sender is
//! unknown, whose transport origin disagrees with the claim, or whose signature does not verify
//! is dropped (and counted) without touching protocol state. Missing messages are normal input
//! to the protocol, never errors.

use std::process;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::app::App;
use crate::config::{IdentityConfig, ProtocolConfig};
use crate::events::Event;
use crate::messages::Message;
use crate::networking::{
    ClientGateway, Network, ProgressMessageStub, ProgressMessageReceiveError, SenderHandle,
};
use crate::observer::{Role, Status, StatusCamera, SubmitJob};
use crate::pbft::protocol::{Pbft, PbftConfiguration};
use crate::state::ReplicaLog;
use crate::types::basic::ReplicaId;
use crate::types::replica_set::ReplicaSet;
use crate::view_sync::protocol::{ViewSync, ViewSyncConfiguration};

/// How long one receive attempt waits for a message before the loop comes back around to tick
/// the progress timer and drain submissions.
const RECV_WAIT: Duration = Duration::from_millis(20);

pub(crate) struct Algorithm<A: App, N: Network + 'static, G: ClientGateway> {
    me: ReplicaId,
    replica_set: ReplicaSet,
    log: ReplicaLog,
    pbft: Pbft<N, G>,
    view_sync: ViewSync<N>,
    pm_stub: ProgressMessageStub,
    app: A,
    submissions: Receiver<SubmitJob>,
    camera: StatusCamera,
    shutdown_signal: Receiver<()>,
}

impl<A: App, N: Network + 'static, G: ClientGateway> Algorithm<A, N, G> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        identity: &IdentityConfig,
        protocol: &ProtocolConfig,
        network: N,
        progress_msg_receiver: Receiver<(ReplicaId, Message)>,
        gateway: G,
        app: A,
        submissions: Receiver<SubmitJob>,
        camera: StatusCamera,
        shutdown_signal: Receiver<()>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let pm_stub =
            ProgressMessageStub::new(progress_msg_receiver, protocol.message_buffer_capacity);

        let pbft = Pbft::new(
            PbftConfiguration {
                me: identity.me,
                keypair: identity.keypair.clone(),
                seq_window: protocol.seq_window,
            },
            identity.replica_set.clone(),
            SenderHandle::new(network.clone()),
            gateway,
            event_publisher.clone(),
        );

        let view_sync = ViewSync::new(
            ViewSyncConfiguration {
                me: identity.me,
                keypair: identity.keypair.clone(),
                progress_timeout: protocol.progress_timeout,
            },
            identity.replica_set.clone(),
            SenderHandle::new(network),
            event_publisher,
        );

        Self {
            me: identity.me,
            replica_set: identity.replica_set.clone(),
            log: ReplicaLog::new(),
            pbft,
            view_sync,
            pm_stub,
            app,
            submissions,
            camera,
            shutdown_signal,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || self.execute())
    }

    fn execute(&mut self) {
        self.camera.update(self.status());

        loop {
            // 1. Obey a shutdown command if one is pending.
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Algorithm thread disconnected from main thread")
                }
            }

            // 2. Check the progress timer.
            self.view_sync.tick(&mut self.log);

            // 3. Drain submitted client requests.
            while let Ok(job) = self.submissions.try_recv() {
                let intake = self.pbft.on_client_request(job.request, &mut self.log);
                if let Some(outcome) = job.outcome {
                    let _ = outcome.send(intake);
                }
            }

            // 4. Receive and process at most one inbound message.
            match self.pm_stub.recv(self.log.view(), Instant::now() + RECV_WAIT) {
                Ok((origin, msg)) => self.on_message(origin, msg),
                Err(ProgressMessageReceiveError::Timeout) => (),
                Err(ProgressMessageReceiveError::Disconnected) => return,
            }

            // 5. Execute whatever became ready, in ascending contiguous seq order.
            match self.pbft.execute_ready(&mut self.log, &mut self.app) {
                Ok(executed_any) => {
                    if executed_any {
                        self.view_sync.note_progress();
                    }
                }
                Err(err) => {
                    log::error!(
                        "replica {} internal invariant violation: {:?}",
                        self.me,
                        err
                    );
                    process::exit(3);
                }
            }

            // 6. Refresh the snapshot served to observers.
            self.camera.update(self.status());
        }
    }

    /// Authenticate one inbound message and hand it to the owning subprotocol.
    fn on_message(&mut self, origin: ReplicaId, msg: Message) {
        let sender = msg.sender();

        // Unknown sender: drop.
        let key = match self.replica_set.verifying_key(&sender) {
            Some(key) => key,
            None => {
                log::debug!(
                    "replica {} dropping message from unknown sender {}",
                    self.me,
                    sender
                );
                return;
            }
        };

        // The transport origin must agree with the claimed sender, and the signature must
        // verify under the claimed sender's key. Failures are absorbed silently and counted.
        if origin != sender || !msg.is_correct(key) {
            self.log.note_auth_rejection();
            return;
        }

        match msg {
            Message::PbftMessage(pbft_msg) => {
                match self.pbft.on_receive_msg(pbft_msg, sender, &mut self.log) {
                    Ok(outcome) => {
                        if outcome.progress {
                            self.view_sync.note_progress();
                        }
                        if let Some(reason) = outcome.suspect_primary {
                            self.view_sync.advance_view(&mut self.log, reason);
                        }
                    }
                    Err(err) => {
                        log::error!(
                            "replica {} internal invariant violation: {:?}",
                            self.me,
                            err
                        );
                        process::exit(3);
                    }
                }
            }
            Message::ViewSyncMessage(view_sync_msg) => {
                self.view_sync
                    .on_receive_msg(view_sync_msg, sender, &mut self.log);
            }
        }
    }

    fn status(&self) -> Status {
        let view = self.log.view();
        let primary = self.replica_set.primary(view);
        Status {
            replica: self.me,
            role: if primary == self.me {
                Role::Primary
            } else {
                Role::Backup
            },
            view,
            primary,
            f: self.replica_set.f() as u32,
            n: self.replica_set.n() as u32,
            last_executed: self.log.last_executed(),
            prepared_slots: self.log.prepared_slots(),
            committed_slots: self.log.committed_slots(),
            auth_rejections: self.log.auth_rejections(),
        }
    }
}
