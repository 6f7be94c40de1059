/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that [start](Replica::start) a replica, as well as [the type](Replica) which keeps
//! the replica alive.
//!
//! PBFT-rs works to safely replicate an ordered log of client requests in multiple processes. In
//! our terminology, these processes are called 'replicas', and the set of all replicas is the
//! 'replica set'. Each replica is uniquely identified by a small integer id, and the replica at
//! position `view mod n` of the set is the 'primary' of that view: the one that assigns sequence
//! numbers to client requests.
//!
//! A running replica consists of up to three background threads:
//! 1. The *poller*, which drains the [Network] and feeds the algorithm thread.
//! 2. The *algorithm* thread, the single owner of all mutable protocol state.
//! 3. The *event bus*, started only when event handlers or event logging are configured.
//!
//! The caller supplies the transport ([Network]), the [ClientGateway] through which replies
//! reach clients, and the submission channel whose receiving half the algorithm thread drains.
//! Wiring those up externally keeps the replica indifferent to whether it runs as one OS process
//! in a cluster or as one actor among many inside a test.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use crate::algorithm::Algorithm;
use crate::app::App;
use crate::config::Configuration;
use crate::event_bus::{start_event_bus, EventHandlers};
use crate::networking::{start_polling, ClientGateway, Network};
use crate::observer::{Status, StatusCamera, SubmitHandle, SubmitJob};
use crate::pbft::messages::ClientRequest;

pub struct Replica {
    camera: StatusCamera,
    submit_handle: SubmitHandle,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Replica {
    /// Start a replica. The `config` must have been [validated](Configuration::validate).
    ///
    /// `submissions` is the receiving half of a [submit channel](crate::observer::submit_channel)
    /// whose sending half (`submit_handle`) is shared with the observer surface; `camera` is the
    /// status snapshot the algorithm thread keeps refreshed.
    #[allow(clippy::too_many_arguments)]
    pub fn start<A: App, N: Network + 'static, G: ClientGateway>(
        config: Configuration,
        app: A,
        mut network: N,
        gateway: G,
        submissions: Receiver<SubmitJob>,
        submit_handle: SubmitHandle,
        camera: StatusCamera,
        event_handlers: EventHandlers,
    ) -> Replica {
        network.init_replica_set(config.identity.replica_set.clone());

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, progress_msg_receiver) =
            start_polling(network.clone(), poller_shutdown_receiver);

        let (event_bus, event_bus_shutdown, event_publisher) = if !event_handlers.is_empty() {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
            let event_bus = start_event_bus(
                event_handlers,
                event_subscriber,
                event_bus_shutdown_receiver,
            );
            (Some(event_bus), Some(event_bus_shutdown), Some(event_publisher))
        } else {
            (None, None, None)
        };

        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm = Algorithm::new(
            &config.identity,
            &config.protocol,
            network,
            progress_msg_receiver,
            gateway,
            app,
            submissions,
            camera.clone(),
            algorithm_shutdown_receiver,
            event_publisher,
        )
        .start();

        Replica {
            camera,
            submit_handle,
            poller: Some(poller),
            poller_shutdown,
            algorithm: Some(algorithm),
            algorithm_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }

    /// A point-in-time snapshot of this replica's protocol state.
    pub fn status(&self) -> Status {
        self.camera.snapshot()
    }

    /// Submit a client request to this replica, as if from a local client.
    pub fn submit(&self, request: ClientRequest) {
        self.submit_handle.submit(request)
    }

    pub fn submit_handle(&self) -> SubmitHandle {
        self.submit_handle.clone()
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important, as the threads
        // make assumptions about the validity of their channels based on this. The algorithm
        // thread receives messages from the poller and assumes that the poller will live longer
        // than it.

        if let Some(event_bus_shutdown) = &self.event_bus_shutdown {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            event_bus.join().unwrap();
        }

        self.algorithm_shutdown.send(()).unwrap();
        self.algorithm.take().unwrap().join().unwrap();

        self.poller_shutdown.send(()).unwrap();
        self.poller.take().unwrap().join().unwrap();
    }
}
