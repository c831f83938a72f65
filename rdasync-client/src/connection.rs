//! # Connection Driver
//!
//! Purpose: Run one connection as a tokio task. The task owns the transport,
//! the read buffer and the state machine; everything else talks to it through
//! a `ConnectionHandle`.
//!
//! ## Design Principles
//! 1. **Single Owner**: Transport and buffer are touched only by the driver
//!    task, so they need no locking.
//! 2. **Sans-IO Core**: The driver feeds events into `ConnectionFsm` and
//!    performs the actions it emits, in order.
//! 3. **Owner Callbacks**: Lifecycle changes reach the pool through the
//!    `ConnectionOwner` trait; panics there are logged and swallowed.
//! 4. **No Lost Requests**: Requests that reach a dead connection are failed
//!    with `ConnectionError::Terminated`.

use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use rdasync_common::{ConnectionError, ConnectionOptions};

use crate::fsm::{Action, ConnectionFsm, Event, Query};
use crate::resp::{self, Parsed, Reply};
use crate::strand::{panic_message, Strand};
use crate::transport::Transport;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Receives lifecycle notifications from a connection.
///
/// Called from the driver task, never while it holds caller callbacks.
pub trait ConnectionOwner: Send + Sync + 'static {
    /// The connection has no request in flight and nothing deferred.
    fn connection_idle(&self, id: ConnectionId);

    /// The connection failed; `connection_terminated` follows.
    fn connection_error(&self, id: ConnectionId, error: &ConnectionError);

    /// The connection is gone. Sent exactly once.
    fn connection_terminated(&self, id: ConnectionId);
}

enum Control {
    Execute(Query),
    Terminate,
}

/// Cheap, clonable sender side of a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Control>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Hands a request to the connection.
    ///
    /// Returns the request back when the driver has already exited.
    pub fn execute(&self, query: Query) -> Result<(), Query> {
        self.tx.send(Control::Execute(query)).map_err(|err| match err.0 {
            Control::Execute(query) => query,
            Control::Terminate => unreachable!("sent an execute"),
        })
    }

    /// Asks the connection to shut down once its current request resolves.
    pub fn terminate(&self) {
        // A closed channel means the driver is already gone.
        let _ = self.tx.send(Control::Terminate);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Builds a connection: the handle to keep and the driver to spawn.
///
/// The caller registers the handle before spawning so owner callbacks can
/// always resolve it.
pub fn connection<T, O>(
    transport: T,
    options: ConnectionOptions,
    owner: O,
    strand: Strand,
    read_buffer_size: usize,
) -> (ConnectionHandle, ConnectionDriver<T, O>)
where
    T: Transport,
    O: ConnectionOwner,
{
    let id = ConnectionId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    let driver = ConnectionDriver {
        fsm: ConnectionFsm::new(id),
        transport,
        owner,
        strand,
        rx,
        control_open: true,
        buffer: BytesMut::with_capacity(read_buffer_size),
        read_chunk: read_buffer_size.max(64),
        options,
        reading: false,
        reply_deadline: None,
    };
    (ConnectionHandle { id, tx }, driver)
}

enum Wake {
    Control(Option<Control>),
    Read(io::Result<usize>),
    ReplyTimeout,
    Stalled,
}

/// Task body of one connection.
pub struct ConnectionDriver<T, O> {
    fsm: ConnectionFsm,
    transport: T,
    owner: O,
    strand: Strand,
    rx: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
    buffer: BytesMut,
    read_chunk: usize,
    options: ConnectionOptions,
    reading: bool,
    reply_deadline: Option<Instant>,
}

impl<T: Transport, O: ConnectionOwner> ConnectionDriver<T, O> {
    pub fn id(&self) -> ConnectionId {
        self.fsm.id()
    }

    /// Spawns the driver on `runtime`.
    pub fn spawn(self, runtime: &Handle) {
        runtime.spawn(self.run());
    }

    /// Drives the connection until it terminates.
    pub async fn run(mut self) {
        debug!(conn = %self.id(), alias = %self.options.alias, uri = %self.options.uri, "connection starting");
        feed(&mut self.fsm, Event::Connect(self.options.clone()));

        loop {
            self.perform_actions().await;
            if self.fsm.is_terminated() {
                break;
            }

            match self.wait().await {
                Wake::Control(control) => {
                    let event = control_event(control, &mut self.control_open);
                    feed(&mut self.fsm, event);
                }
                Wake::Read(Ok(0)) => feed(&mut self.fsm, ConnectionError::ClosedByPeer.into()),
                Wake::Read(Ok(read)) => {
                    trace!(conn = %self.id(), bytes = read, buffered = self.buffer.len(), "read");
                    self.decode();
                }
                Wake::Read(Err(err)) => feed(&mut self.fsm, ConnectionError::from(err).into()),
                Wake::ReplyTimeout => {
                    let after = self.options.socket_timeout.unwrap_or_default();
                    feed(
                        &mut self.fsm,
                        ConnectionError::Timeout {
                            operation: "reply",
                            after,
                        }
                        .into(),
                    );
                }
                Wake::Stalled => feed(&mut self.fsm, ConnectionError::Terminated.into()),
            }
        }

        // Anything sent after termination is refused.
        self.rx.close();
        while let Ok(control) = self.rx.try_recv() {
            if let Control::Execute(query) = control {
                let (callbacks, outcome) = query.into_failed(ConnectionError::Terminated);
                self.strand.deliver(callbacks, outcome);
            }
        }
        info!(conn = %self.id(), alias = %self.options.alias, "connection closed");
    }

    async fn perform_actions(&mut self) {
        while let Some(action) = self.fsm.next_action() {
            match action {
                Action::Connect(options) => {
                    let result = self.connect(&options).await;
                    let event = match result {
                        Ok(()) => {
                            debug!(conn = %self.id(), uri = %options.uri, "transport connected");
                            Event::Connected
                        }
                        Err(err) => err.into(),
                    };
                    feed(&mut self.fsm, event);
                }
                Action::StartRead => self.reading = true,
                Action::Write(bytes) => {
                    self.reply_deadline = self.options.socket_timeout.map(|t| Instant::now() + t);
                    let write = self.transport.write(&bytes);
                    if let Err(err) = with_timeout("write", self.options.socket_timeout, write).await {
                        feed(&mut self.fsm, err.into());
                    }
                }
                Action::Deliver { callbacks, outcome } => self.strand.deliver(callbacks, outcome),
                Action::Close => {
                    self.reading = false;
                    self.transport.close();
                }
                Action::NotifyIdle => self.notify("idle", |owner, id| owner.connection_idle(id)),
                Action::NotifyError(err) => {
                    warn!(conn = %self.id(), alias = %self.options.alias, error = %err, "connection error");
                    self.notify("error", |owner, id| owner.connection_error(id, &err));
                }
                Action::NotifyTerminated => {
                    self.notify("terminated", |owner, id| owner.connection_terminated(id))
                }
            }
        }
        if !self.fsm.awaiting_reply() {
            self.reply_deadline = None;
        }
    }

    /// Connects while still accepting control messages, which the state
    /// machine defers until the handshake finishes.
    async fn connect(&mut self, options: &ConnectionOptions) -> Result<(), ConnectionError> {
        let connect = with_timeout("connect", options.connect_timeout, self.transport.connect(options));
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => return result,
                control = self.rx.recv(), if self.control_open => {
                    let event = control_event(control, &mut self.control_open);
                    feed(&mut self.fsm, event);
                }
            }
        }
    }

    async fn wait(&mut self) -> Wake {
        if self.reading {
            self.buffer.reserve(self.read_chunk);
        }
        let deadline = self.reply_deadline;
        tokio::select! {
            control = self.rx.recv(), if self.control_open => Wake::Control(control),
            read = self.transport.read(&mut self.buffer), if self.reading => Wake::Read(read),
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Wake::ReplyTimeout
            }
            else => Wake::Stalled,
        }
    }

    /// Feeds every complete reply in the buffer to the state machine.
    fn decode(&mut self) {
        while !self.buffer.is_empty() && !self.fsm.is_terminated() {
            match resp::parse(&self.buffer) {
                Ok(Parsed { reply, consumed }) => {
                    self.buffer.advance(consumed);
                    if !self.fsm.awaiting_reply() {
                        feed(&mut self.fsm, ConnectionError::UnexpectedReply.into());
                        break;
                    }
                    let event = match reply {
                        Reply::Value(value) => Event::Reply(value),
                        Reply::ServerError(message) => Event::ServerError(message),
                    };
                    feed(&mut self.fsm, event);
                }
                Err(err) if err.is_incomplete() => break,
                Err(err) => {
                    feed(&mut self.fsm, ConnectionError::from(err).into());
                    break;
                }
            }
        }
    }

    fn notify(&self, what: &'static str, notify: impl FnOnce(&O, ConnectionId)) {
        let id = self.id();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| notify(&self.owner, id))) {
            warn!(conn = %id, notification = what, panic = %panic_message(panic.as_ref()), "owner notification panicked");
        }
    }
}

fn control_event(control: Option<Control>, open: &mut bool) -> Event {
    match control {
        Some(Control::Execute(query)) => Event::Execute(query),
        Some(Control::Terminate) => Event::Terminate,
        // Every handle is gone; nobody can reach this connection again.
        None => {
            *open = false;
            Event::Terminate
        }
    }
}

fn feed(fsm: &mut ConnectionFsm, event: Event) {
    if let Err(violation) = fsm.handle(event) {
        panic!("connection state machine violated: {}", violation);
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    limit: Option<Duration>,
    future: impl Future<Output = io::Result<T>>,
) -> Result<T, ConnectionError> {
    match limit {
        Some(after) => match tokio::time::timeout(after, future).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Timeout { operation, after }),
        },
        None => future.await.map_err(ConnectionError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use rdasync_common::{Command, Value};

    use crate::strand::Callbacks;
    use crate::transport::TcpTransport;

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ConnectionOwner for Recorder {
        fn connection_idle(&self, _id: ConnectionId) {
            self.events.lock().unwrap().push("idle".to_string());
        }

        fn connection_error(&self, _id: ConnectionId, error: &ConnectionError) {
            self.events.lock().unwrap().push(format!("error: {}", error));
        }

        fn connection_terminated(&self, _id: ConnectionId) {
            self.events.lock().unwrap().push("terminated".to_string());
        }
    }

    fn ping() -> (Query, oneshot::Receiver<rdasync_common::Result<Value>>) {
        let (callbacks, rx) = Callbacks::channel();
        (Query::new(Command::verb("PING"), callbacks), rx)
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
        assert_eq!(format!("{}", a), format!("conn#{}", a.get()));
    }

    #[tokio::test]
    async fn answers_split_reply_and_terminates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            // Reply in two segments to exercise partial decoding.
            stream.write_all(b"+PO").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(b"NG\r\n").await.unwrap();
            let _ = stream.read(&mut buf).await;
        });

        let owner = Recorder::default();
        let strand = Strand::new(&Handle::current());
        let (handle, driver) = connection(
            TcpTransport::new(),
            ConnectionOptions::tcp("t", addr),
            owner.clone(),
            strand,
            16,
        );
        let task = tokio::spawn(driver.run());

        let (query, rx) = ping();
        handle.execute(query).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Value::string("PONG"));

        handle.terminate();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_closed());
        assert_eq!(owner.events().last().map(String::as_str), Some("terminated"));
        assert!(!owner.events().iter().any(|e| e.starts_with("error")));

        let (late, late_rx) = ping();
        assert!(handle.execute(late).is_err());
        drop(late_rx);
        server.abort();
    }

    #[tokio::test]
    async fn refused_connect_reports_error_and_fails_request() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let owner = Recorder::default();
        let (handle, driver) = connection(
            TcpTransport::new(),
            ConnectionOptions::tcp("t", addr),
            owner.clone(),
            Strand::new(&Handle::current()),
            1024,
        );
        let (query, rx) = ping();
        handle.execute(query).unwrap();
        tokio::time::timeout(Duration::from_secs(5), driver.run())
            .await
            .unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.as_connection(), Some(&ConnectionError::Terminated));
        let events = owner.events();
        assert_eq!(events.len(), 2, "{:?}", events);
        assert!(events[0].starts_with("error"));
        assert_eq!(events[1], "terminated");
    }

    #[tokio::test]
    async fn reply_timeout_kills_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let options = ConnectionOptions::tcp("t", addr).with_socket_timeout(Duration::from_millis(50));
        let (handle, driver) = connection(
            TcpTransport::new(),
            options,
            Recorder::default(),
            Strand::new(&Handle::current()),
            1024,
        );
        let task = tokio::spawn(driver.run());
        let (query, rx) = ping();
        handle.execute(query).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err.as_connection(),
            Some(ConnectionError::Timeout { operation: "reply", .. })
        ));
        task.await.unwrap();
        server.abort();
    }
}
