/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the [algorithm](crate::algorithm) thread and passes
//! them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers
//! the execution of all handlers defined for the contained event type, where the handlers for
//! each event type are stored in [`EventHandlers`].
//!
//! When no handlers are present in a replica's instance of `EventHandlers` this thread is not
//! started.
//!
//! ## Event Handlers
//!
//! A replica's instance of `EventHandlers` contains:
//! 1. The handlers provided upon starting the replica via
//!    [`Replica::start`](crate::replica::Replica::start), and
//! 2. If logging is enabled, the default logging handlers defined in [logging](crate::logging).

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait, namely one logging handler, defined in [`logging`](crate::logging), and one
/// user-defined handler.
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    // Checks if no event handlers are defined for this event.
    pub(crate) fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging
    /// handler if logging is enabled.
    pub(crate) fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        self.user_defined_handler
            .iter()
            .for_each(|handler| handler(event));
        self.logging_handler
            .iter()
            .for_each(|handler| handler(event));
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each pre-defined
/// event type from [events](crate::events).
pub struct EventHandlers {
    pub(crate) receive_request_handlers: HandlerPair<ReceiveRequestEvent>,
    pub(crate) forward_request_handlers: HandlerPair<ForwardRequestEvent>,

    pub(crate) pre_prepare_handlers: HandlerPair<PrePrepareEvent>,
    pub(crate) prepare_handlers: HandlerPair<PrepareEvent>,
    pub(crate) commit_handlers: HandlerPair<CommitEvent>,

    pub(crate) receive_pre_prepare_handlers: HandlerPair<ReceivePrePrepareEvent>,
    pub(crate) receive_prepare_handlers: HandlerPair<ReceivePrepareEvent>,
    pub(crate) receive_commit_handlers: HandlerPair<ReceiveCommitEvent>,

    pub(crate) prepared_handlers: HandlerPair<PreparedEvent>,
    pub(crate) committed_handlers: HandlerPair<CommittedEvent>,
    pub(crate) execute_handlers: HandlerPair<ExecuteEvent>,

    pub(crate) equivocation_handlers: HandlerPair<EquivocationEvent>,
    pub(crate) view_timeout_handlers: HandlerPair<ViewTimeoutEvent>,
    pub(crate) set_view_handlers: HandlerPair<SetViewEvent>,
    pub(crate) receive_set_view_handlers: HandlerPair<ReceiveSetViewEvent>,
    pub(crate) start_view_handlers: HandlerPair<StartViewEvent>,
}

impl EventHandlers {
    /// Creates the [handler pairs](HandlerPair) for all pre-defined event types from
    /// [events](crate::events) given the user-defined handlers, and information on whether
    /// logging is enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: bool,
        receive_request_handler: Option<HandlerPtr<ReceiveRequestEvent>>,
        forward_request_handler: Option<HandlerPtr<ForwardRequestEvent>>,
        pre_prepare_handler: Option<HandlerPtr<PrePrepareEvent>>,
        prepare_handler: Option<HandlerPtr<PrepareEvent>>,
        commit_handler: Option<HandlerPtr<CommitEvent>>,
        receive_pre_prepare_handler: Option<HandlerPtr<ReceivePrePrepareEvent>>,
        receive_prepare_handler: Option<HandlerPtr<ReceivePrepareEvent>>,
        receive_commit_handler: Option<HandlerPtr<ReceiveCommitEvent>>,
        prepared_handler: Option<HandlerPtr<PreparedEvent>>,
        committed_handler: Option<HandlerPtr<CommittedEvent>>,
        execute_handler: Option<HandlerPtr<ExecuteEvent>>,
        equivocation_handler: Option<HandlerPtr<EquivocationEvent>>,
        view_timeout_handler: Option<HandlerPtr<ViewTimeoutEvent>>,
        set_view_handler: Option<HandlerPtr<SetViewEvent>>,
        receive_set_view_handler: Option<HandlerPtr<ReceiveSetViewEvent>>,
        start_view_handler: Option<HandlerPtr<StartViewEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            receive_request_handlers: HandlerPair::new(log, receive_request_handler),
            forward_request_handlers: HandlerPair::new(log, forward_request_handler),
            pre_prepare_handlers: HandlerPair::new(log, pre_prepare_handler),
            prepare_handlers: HandlerPair::new(log, prepare_handler),
            commit_handlers: HandlerPair::new(log, commit_handler),
            receive_pre_prepare_handlers: HandlerPair::new(log, receive_pre_prepare_handler),
            receive_prepare_handlers: HandlerPair::new(log, receive_prepare_handler),
            receive_commit_handlers: HandlerPair::new(log, receive_commit_handler),
            prepared_handlers: HandlerPair::new(log, prepared_handler),
            committed_handlers: HandlerPair::new(log, committed_handler),
            execute_handlers: HandlerPair::new(log, execute_handler),
            equivocation_handlers: HandlerPair::new(log, equivocation_handler),
            view_timeout_handlers: HandlerPair::new(log, view_timeout_handler),
            set_view_handlers: HandlerPair::new(log, set_view_handler),
            receive_set_view_handlers: HandlerPair::new(log, receive_set_view_handler),
            start_view_handlers: HandlerPair::new(log, start_view_handler),
        }
    }

    /// Creates `EventHandlers` with no user-defined handlers, enabling only the default logging
    /// handlers if `log` is true.
    pub fn logging_only(log: bool) -> EventHandlers {
        EventHandlers::new(
            log, None, None, None, None, None, None, None, None, None, None, None, None, None,
            None, None, None,
        )
    }

    /// Checks if no handlers are defined, i.e., neither user-defined handlers were defined nor
    /// logging is enabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.receive_request_handlers.is_empty()
            && self.forward_request_handlers.is_empty()
            && self.pre_prepare_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.receive_pre_prepare_handlers.is_empty()
            && self.receive_prepare_handlers.is_empty()
            && self.receive_commit_handlers.is_empty()
            && self.prepared_handlers.is_empty()
            && self.committed_handlers.is_empty()
            && self.execute_handlers.is_empty()
            && self.equivocation_handlers.is_empty()
            && self.view_timeout_handlers.is_empty()
            && self.set_view_handlers.is_empty()
            && self.receive_set_view_handlers.is_empty()
            && self.start_view_handlers.is_empty()
    }

    /// Triggers the execution of each of the two handlers - the user-defined and the logging
    /// handler, if defined - for a given event type from [events](crate::events).
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ReceiveRequest(event) => self.receive_request_handlers.fire(&event),
            Event::ForwardRequest(event) => self.forward_request_handlers.fire(&event),
            Event::PrePrepare(event) => self.pre_prepare_handlers.fire(&event),
            Event::Prepare(event) => self.prepare_handlers.fire(&event),
            Event::Commit(event) => self.commit_handlers.fire(&event),
            Event::ReceivePrePrepare(event) => self.receive_pre_prepare_handlers.fire(&event),
            Event::ReceivePrepare(event) => self.receive_prepare_handlers.fire(&event),
            Event::ReceiveCommit(event) => self.receive_commit_handlers.fire(&event),
            Event::Prepared(event) => self.prepared_handlers.fire(&event),
            Event::Committed(event) => self.committed_handlers.fire(&event),
            Event::Execute(event) => self.execute_handlers.fire(&event),
            Event::Equivocation(event) => self.equivocation_handlers.fire(&event),
            Event::ViewTimeout(event) => self.view_timeout_handlers.fire(&event),
            Event::SetView(event) => self.set_view_handlers.fire(&event),
            Event::ReceiveSetView(event) => self.receive_set_view_handlers.fire(&event),
            Event::StartView(event) => self.start_view_handlers.fire(&event),
        }
    }
}

/// Starts the event bus thread, which runs an infinite loop until a shutdown signal is received
/// from the parent thread. In each iteration of the loop, the thread checks if it received any
/// event notifications, and if so, triggers the execution of the handlers defined for the event.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            // The algorithm thread (the event publisher) exits before the event bus is told to
            // shut down, so a disconnect here just means no more events are coming.
            Err(TryRecvError::Disconnected) => thread::yield_now(),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Sender};
    use std::time::SystemTime;

    use crate::types::basic::{Digest, SequenceNumber, ViewNumber};

    use super::*;

    #[test]
    fn user_defined_handler_fires_for_its_event() {
        let (fired, fired_receiver) = mpsc::channel::<SequenceNumber>();
        let handler: HandlerPtr<PreparedEvent> = {
            let fired: Sender<SequenceNumber> = fired.clone();
            Box::new(move |event| {
                let _ = fired.send(event.seq);
            })
        };

        let mut handlers = EventHandlers::logging_only(false);
        handlers.prepared_handlers = HandlerPair::new(false, Some(handler));
        assert!(!handlers.is_empty());

        handlers.fire_handlers(Event::Prepared(PreparedEvent {
            timestamp: SystemTime::now(),
            view: ViewNumber::init(),
            seq: SequenceNumber::new(3),
            digest: Digest::new([0u8; 32]),
            prepares: 2,
        }));

        assert_eq!(fired_receiver.try_recv().unwrap(), SequenceNumber::new(3));
    }

    #[test]
    fn logging_only_with_logging_disabled_is_empty() {
        assert!(EventHandlers::logging_only(false).is_empty());
        assert!(!EventHandlers::logging_only(true).is_empty());
    }
}
