//! # Connection State Machine
//!
//! Purpose: Decide what one connection does next, given its current state and
//! an incoming event. The machine performs no I/O; it emits `Action`s that the
//! connection driver carries out.
//!
//! ## Design Principles
//! 1. **Explicit States**: `Phase` is a tagged enum; per-state data (handshake
//!    progress, the in-flight request) lives inside its variant.
//! 2. **Deferred Events**: Events a state cannot handle yet are queued and
//!    replayed, in arrival order, after every state change.
//! 3. **Loud Violations**: A (state, event) pair with no transition returns
//!    `NoTransition`; the driver treats it as a bug and aborts.
//! 4. **Exactly-Once Delivery**: Each request's `Callbacks` leaves the machine
//!    in exactly one `Action::Deliver`.
//!
//! ## Transitions
//!
//! ```text
//! unplugged      --connect-->         connecting      [Connect]
//! unplugged      --terminate-->       terminated
//! connecting     --connected-->       authenticating  [StartRead, Write(handshake)]
//! authenticating --complete/replies-> idle            [NotifyIdle]
//! idle           --execute-->         querying        [Write]
//! querying       --reply/error-->     idle            [Deliver, NotifyIdle]
//! idle           --terminate-->       terminated      [Close]
//! any live state --conn error-->      terminated      [NotifyError, Close]
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::mem;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use rdasync_common::{ConnectionError, ConnectionOptions, QueryError, Request, Result, Value};

use crate::commands;
use crate::connection::ConnectionId;
use crate::resp;
use crate::strand::Callbacks;

/// A request travelling with the callbacks that receive its outcome.
#[derive(Debug)]
pub struct Query {
    pub request: Request,
    pub callbacks: Callbacks,
}

impl Query {
    pub fn new(request: impl Into<Request>, callbacks: Callbacks) -> Self {
        Query {
            request: request.into(),
            callbacks,
        }
    }

    /// Resolves the query with an error, consuming it.
    pub fn into_failed(self, err: impl Into<rdasync_common::Error>) -> (Callbacks, Result<Value>) {
        (self.callbacks, Err(err.into()))
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Unplugged,
    Connecting,
    Authenticating,
    Idle,
    Querying,
    Terminated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Unplugged => "unplugged",
            State::Connecting => "connecting",
            State::Authenticating => "authenticating",
            State::Idle => "idle",
            State::Querying => "querying",
            State::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Input to the machine.
#[derive(Debug)]
pub enum Event {
    /// Start connecting with these options.
    Connect(ConnectionOptions),
    /// The transport finished connecting.
    Connected,
    /// The handshake has nothing left to wait for.
    Complete,
    /// A decoded reply value.
    Reply(Value),
    /// A decoded `-` error reply.
    ServerError(String),
    Execute(Query),
    Terminate,
    ConnectionError(ConnectionError),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connect(_) => EventKind::Connect,
            Event::Connected => EventKind::Connected,
            Event::Complete => EventKind::Complete,
            Event::Reply(_) => EventKind::Reply,
            Event::ServerError(_) => EventKind::ServerError,
            Event::Execute(_) => EventKind::Execute,
            Event::Terminate => EventKind::Terminate,
            Event::ConnectionError(_) => EventKind::ConnectionError,
        }
    }
}

impl From<ConnectionError> for Event {
    fn from(err: ConnectionError) -> Self {
        Event::ConnectionError(err)
    }
}

/// Payload-free tag of an `Event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Connected,
    Complete,
    Reply,
    ServerError,
    Execute,
    Terminate,
    ConnectionError,
}

/// Work the driver performs on behalf of the machine, in order.
#[derive(Debug)]
pub enum Action {
    /// Open the transport.
    Connect(ConnectionOptions),
    /// Start feeding transport reads back as events.
    StartRead,
    Write(Bytes),
    /// Hand an outcome to the caller's callbacks.
    Deliver {
        callbacks: Callbacks,
        outcome: Result<Value>,
    },
    /// Close the transport.
    Close,
    /// Tell the owner this connection can take a request.
    NotifyIdle,
    /// Tell the owner the connection failed.
    NotifyError(ConnectionError),
    /// Tell the owner the connection is gone. Always the last action.
    NotifyTerminated,
}

/// The machine received an event its current state has no transition for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{connection}: no transition from state {state} on event {event:?}")]
pub struct NoTransition {
    pub connection: ConnectionId,
    pub state: State,
    pub event: EventKind,
}

struct InFlight {
    callbacks: Callbacks,
    batch: bool,
    remaining: usize,
    replies: Vec<Value>,
    first_error: Option<String>,
}

impl InFlight {
    fn outcome(mut self) -> (Callbacks, Result<Value>) {
        let outcome = match self.first_error {
            Some(message) => Err(QueryError::new(message).into()),
            None if self.batch => Ok(Value::Array(self.replies)),
            None => Ok(self.replies.pop().unwrap_or(Value::Nil)),
        };
        (self.callbacks, outcome)
    }
}

enum Phase {
    Unplugged,
    Connecting,
    Authenticating { awaiting: usize },
    Idle,
    Querying(InFlight),
    Terminated,
}

impl Phase {
    fn state(&self) -> State {
        match self {
            Phase::Unplugged => State::Unplugged,
            Phase::Connecting => State::Connecting,
            Phase::Authenticating { .. } => State::Authenticating,
            Phase::Idle => State::Idle,
            Phase::Querying(_) => State::Querying,
            Phase::Terminated => State::Terminated,
        }
    }
}

/// Per-connection protocol state machine.
pub struct ConnectionFsm {
    id: ConnectionId,
    phase: Phase,
    options: Option<ConnectionOptions>,
    deferred: VecDeque<Event>,
    actions: VecDeque<Action>,
    state_changed: bool,
    entered_idle: bool,
}

impl ConnectionFsm {
    pub fn new(id: ConnectionId) -> Self {
        ConnectionFsm {
            id,
            phase: Phase::Unplugged,
            options: None,
            deferred: VecDeque::new(),
            actions: VecDeque::new(),
            state_changed: false,
            entered_idle: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.phase.state()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.phase, Phase::Terminated)
    }

    /// True while a reply from the server is expected.
    pub fn awaiting_reply(&self) -> bool {
        match &self.phase {
            Phase::Authenticating { awaiting } => *awaiting > 0,
            Phase::Querying(_) => true,
            _ => false,
        }
    }

    /// Number of events waiting for a later state.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Pops the next action to perform.
    pub fn next_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Feeds one event, then replays deferred events after each state change.
    pub fn handle(&mut self, event: Event) -> std::result::Result<(), NoTransition> {
        self.dispatch(event)?;

        // Events stay queued until dispatched; termination fails the rest.
        while mem::take(&mut self.state_changed) {
            let mut idx = 0;
            while idx < self.deferred.len() {
                if self.defers(&self.deferred[idx]) {
                    idx += 1;
                    continue;
                }
                let Some(event) = self.deferred.remove(idx) else {
                    break;
                };
                trace!(conn = %self.id, state = %self.state(), event = ?event.kind(), "replaying deferred event");
                self.dispatch(event)?;
                if self.state_changed {
                    break;
                }
            }
        }

        if mem::take(&mut self.entered_idle) && matches!(self.phase, Phase::Idle) {
            self.actions.push_back(Action::NotifyIdle);
        }
        Ok(())
    }

    fn defers(&self, event: &Event) -> bool {
        match (&self.phase, event) {
            (Phase::Unplugged, Event::Execute(_)) => true,
            (Phase::Connecting | Phase::Authenticating { .. }, Event::Execute(_) | Event::Terminate) => true,
            (Phase::Querying(_), Event::Execute(_) | Event::Terminate) => true,
            _ => false,
        }
    }

    fn dispatch(&mut self, event: Event) -> std::result::Result<(), NoTransition> {
        if self.defers(&event) {
            trace!(conn = %self.id, state = %self.state(), event = ?event.kind(), "deferring event");
            self.deferred.push_back(event);
            return Ok(());
        }

        let phase = mem::replace(&mut self.phase, Phase::Terminated);
        match (phase, event) {
            (Phase::Unplugged, Event::Connect(options)) => {
                self.actions.push_back(Action::Connect(options.clone()));
                self.options = Some(options);
                self.enter(Phase::Connecting);
            }
            (Phase::Unplugged, Event::Terminate) => self.terminate(None, None),

            (Phase::Connecting, Event::Connected) => {
                self.actions.push_back(Action::StartRead);
                let (handshake, awaiting) = self.handshake();
                if let Some(bytes) = handshake {
                    self.actions.push_back(Action::Write(bytes));
                }
                self.enter(Phase::Authenticating { awaiting });
                if awaiting == 0 {
                    self.dispatch(Event::Complete)?;
                }
            }
            (Phase::Connecting, Event::ConnectionError(err)) => self.terminate(None, Some(err)),

            (Phase::Authenticating { .. }, Event::Complete) => self.enter(Phase::Idle),
            (Phase::Authenticating { awaiting }, Event::Reply(_)) if awaiting > 0 => {
                if awaiting == 1 {
                    debug!(conn = %self.id, "handshake complete");
                    self.enter(Phase::Idle);
                } else {
                    self.phase = Phase::Authenticating {
                        awaiting: awaiting - 1,
                    };
                }
            }
            (Phase::Authenticating { awaiting }, Event::ServerError(message)) if awaiting > 0 => {
                warn!(conn = %self.id, error = %message, "handshake rejected");
                self.terminate(None, Some(ConnectionError::Authentication(message)));
            }
            (Phase::Authenticating { .. }, Event::ConnectionError(err)) => {
                self.terminate(None, Some(err))
            }

            (Phase::Idle, Event::Execute(query)) => {
                debug!(conn = %self.id, command = %describe(&query.request), "executing");
                self.actions
                    .push_back(Action::Write(resp::encode_request(&query.request)));
                let remaining = query.request.reply_count();
                self.enter(Phase::Querying(InFlight {
                    callbacks: query.callbacks,
                    batch: query.request.is_batch(),
                    remaining,
                    replies: Vec::with_capacity(remaining),
                    first_error: None,
                }));
            }
            (Phase::Idle, Event::Terminate) => self.terminate(None, None),
            (Phase::Idle, Event::ConnectionError(err)) => self.terminate(None, Some(err)),

            (Phase::Querying(mut in_flight), Event::Reply(value)) => {
                in_flight.replies.push(value);
                self.reply_received(in_flight);
            }
            (Phase::Querying(mut in_flight), Event::ServerError(message)) => {
                in_flight.first_error.get_or_insert(message);
                self.reply_received(in_flight);
            }
            (Phase::Querying(in_flight), Event::ConnectionError(err)) => {
                self.terminate(Some(in_flight), Some(err))
            }

            // Absorbing: late requests are refused, everything else is dropped.
            (Phase::Terminated, Event::Execute(query)) => {
                let (callbacks, outcome) = query.into_failed(ConnectionError::Terminated);
                self.actions.push_back(Action::Deliver { callbacks, outcome });
            }
            (Phase::Terminated, event) => {
                trace!(conn = %self.id, event = ?event.kind(), "ignoring event after termination");
            }

            (phase, event) => {
                let state = phase.state();
                self.phase = phase;
                error!(conn = %self.id, %state, event = ?event.kind(), "no transition");
                return Err(NoTransition {
                    connection: self.id,
                    state,
                    event: event.kind(),
                });
            }
        }
        Ok(())
    }

    fn reply_received(&mut self, mut in_flight: InFlight) {
        in_flight.remaining -= 1;
        if in_flight.remaining > 0 {
            self.phase = Phase::Querying(in_flight);
            return;
        }
        let (callbacks, outcome) = in_flight.outcome();
        self.actions.push_back(Action::Deliver { callbacks, outcome });
        self.enter(Phase::Idle);
    }

    /// Builds the AUTH / SELECT preamble and the number of replies it produces.
    fn handshake(&self) -> (Option<Bytes>, usize) {
        let Some(options) = self.options.as_ref() else {
            return (None, 0);
        };

        let mut preamble = Vec::with_capacity(2);
        if let Some(password) = options.password.as_deref() {
            preamble.push(commands::auth(options.user.as_deref(), password));
        }
        if let Some(database) = options.database.filter(|db| *db != 0) {
            preamble.push(commands::select(database));
        }

        if preamble.is_empty() {
            return (None, 0);
        }
        let awaiting = preamble.len();
        (Some(resp::encode_request(&Request::Batch(preamble))), awaiting)
    }

    fn enter(&mut self, phase: Phase) {
        trace!(conn = %self.id, state = %phase.state(), "entering state");
        if matches!(phase, Phase::Idle) {
            self.entered_idle = true;
        }
        self.phase = phase;
        self.state_changed = true;
    }

    fn terminate(&mut self, in_flight: Option<InFlight>, error: Option<ConnectionError>) {
        trace!(conn = %self.id, error = ?error, "entering terminated");
        if let Some(in_flight) = in_flight {
            let failure = error.clone().unwrap_or(ConnectionError::Terminated);
            self.actions.push_back(Action::Deliver {
                callbacks: in_flight.callbacks,
                outcome: Err(failure.into()),
            });
        }
        if let Some(err) = error {
            self.actions.push_back(Action::NotifyError(err));
        }
        self.actions.push_back(Action::Close);

        for event in self.deferred.drain(..) {
            if let Event::Execute(query) = event {
                let (callbacks, outcome) = query.into_failed(ConnectionError::Terminated);
                self.actions.push_back(Action::Deliver { callbacks, outcome });
            }
        }
        self.options = None;
        self.actions.push_back(Action::NotifyTerminated);
        self.enter(Phase::Terminated);
    }
}

impl fmt::Debug for ConnectionFsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFsm")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("deferred", &self.deferred.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}

fn describe(request: &Request) -> String {
    match request {
        Request::Single(command) => command.name(),
        Request::Batch(commands) => format!("batch of {}", commands.len()),
    }
}
