//! # Connection Pool
//!
//! Purpose: Multiplex many concurrent requests for one alias over a bounded
//! set of connections, creating them lazily and draining them on close.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections are reused before new ones
//!    are opened; the live count never exceeds `max_size`.
//! 2. **FIFO Fairness**: Requests that find no idle connection wait in a
//!    queue and are handed out strictly in arrival order.
//! 3. **Minimal Locking**: `idle`, `pending` and `live` each have their own
//!    mutex, always taken in that order, and released before any dispatch.
//! 4. **Weak Back-References**: Connections reach the pool through a `Weak`
//!    link and re-resolve it on every notification.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use rdasync_common::{
    ClientError, ConnectionError, ConnectionOptions, Error, Request, Result, Value,
};

use crate::connection::{connection, ConnectionHandle, ConnectionId, ConnectionOwner};
use crate::fsm::Query;
use crate::strand::{Callbacks, Strand};
use crate::transport::AnyTransport;

/// Runs once every connection of a closing pool has terminated.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections opened and not yet terminated.
    pub live: usize,
    /// Connections parked and ready for a request.
    pub idle: usize,
    /// Requests waiting for a connection.
    pub pending: usize,
    pub closing: bool,
}

struct PoolInner {
    options: ConnectionOptions,
    max_size: usize,
    read_buffer_size: usize,
    runtime: Handle,
    strand: Strand,
    idle: Mutex<VecDeque<ConnectionId>>,
    pending: Mutex<VecDeque<Query>>,
    live: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    closing: AtomicBool,
    on_closed: Mutex<Option<CloseCallback>>,
}

/// Connection pool for one alias.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool. Connections open on first use.
    pub fn new(
        options: ConnectionOptions,
        max_size: usize,
        read_buffer_size: usize,
        runtime: Handle,
    ) -> Result<Self> {
        if max_size == 0 {
            return Err(ClientError::InvalidPoolSize.into());
        }
        options.validate()?;

        info!(alias = %options.alias, schema = %options.schema, uri = %options.uri, max_size, "pool created");
        let strand = Strand::new(&runtime);
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                options,
                max_size,
                read_buffer_size,
                runtime,
                strand,
                idle: Mutex::new(VecDeque::with_capacity(max_size)),
                pending: Mutex::new(VecDeque::new()),
                live: Mutex::new(HashMap::with_capacity(max_size)),
                closing: AtomicBool::new(false),
                on_closed: Mutex::new(None),
            }),
        })
    }

    pub fn alias(&self) -> &str {
        &self.inner.options.alias
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Routes a request to an idle connection, or queues it and grows the pool.
    ///
    /// A closing pool fails the request with `ConnectionError::PoolClosed`.
    pub fn submit(&self, query: Query) {
        self.inner.submit(query);
    }

    /// Callback form of `submit`. Exactly one callback runs, on the pool's strand.
    pub fn execute<R, E>(&self, request: impl Into<Request>, on_result: R, on_error: E)
    where
        R: FnOnce(Value) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.submit(Query::new(request, Callbacks::new(on_result, on_error)));
    }

    /// Async form of `submit`.
    pub async fn query(&self, request: impl Into<Request>) -> Result<Value> {
        let (callbacks, rx) = Callbacks::channel();
        self.submit(Query::new(request, callbacks));
        match rx.await {
            Ok(outcome) => outcome,
            // The strand dropped the sender without running it.
            Err(_) => Err(ConnectionError::Terminated.into()),
        }
    }

    /// Stops accepting work, drains queued requests, then terminates every
    /// connection. `on_closed` runs once no connection is left.
    ///
    /// Calling it again is a no-op and drops the new callback.
    pub fn close(&self, on_closed: impl FnOnce() + Send + 'static) {
        self.inner.close(Box::new(on_closed));
    }

    /// Async form of `close`.
    pub async fn shutdown(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.close(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock();
        let pending = self.inner.pending.lock();
        let live = self.inner.live.lock();
        PoolStats {
            live: live.len(),
            idle: idle.len(),
            pending: pending.len(),
            closing: self.is_closing(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("alias", &self.alias())
            .field("max_size", &self.inner.max_size)
            .field("stats", &self.stats())
            .finish()
    }
}

enum Route {
    Dispatch(ConnectionId, Query),
    Queued,
    Rejected(Query),
}

enum Next {
    Dispatch(Query),
    Terminate,
    Parked,
}

impl PoolInner {
    fn alias(&self) -> &str {
        &self.options.alias
    }

    fn submit(self: &Arc<Self>, query: Query) {
        let route = {
            let mut idle = self.idle.lock();
            if self.closing.load(Ordering::Acquire) {
                Route::Rejected(query)
            } else if let Some(id) = idle.pop_front() {
                Route::Dispatch(id, query)
            } else {
                self.pending.lock().push_back(query);
                Route::Queued
            }
        };

        match route {
            Route::Dispatch(id, query) => self.dispatch(id, query),
            Route::Queued => self.grow(),
            Route::Rejected(query) => self.fail(query, ConnectionError::PoolClosed),
        }
    }

    fn dispatch(self: &Arc<Self>, id: ConnectionId, query: Query) {
        let handle = self.live.lock().get(&id).cloned();
        let query = match handle {
            Some(handle) => match handle.execute(query) {
                Ok(()) => {
                    debug!(alias = %self.alias(), conn = %id, "dispatched request");
                    return;
                }
                Err(query) => query,
            },
            None => query,
        };

        // The connection went away between being picked and being used.
        debug!(alias = %self.alias(), conn = %id, "connection gone, requeueing request");
        self.live.lock().remove(&id);
        let orphan = {
            let _idle = self.idle.lock();
            let mut pending = self.pending.lock();
            let live_empty = self.live.lock().is_empty();
            if self.closing.load(Ordering::Acquire) && live_empty {
                Some(query)
            } else {
                pending.push_front(query);
                None
            }
        };
        match orphan {
            Some(query) => self.fail(query, ConnectionError::PoolClosed),
            None => self.grow(),
        }
    }

    /// Opens one more connection if the queue has work and capacity remains.
    fn grow(self: &Arc<Self>) {
        let (driver, live) = {
            let pending = self.pending.lock();
            let mut live = self.live.lock();
            if self.closing.load(Ordering::Acquire)
                || pending.is_empty()
                || live.len() >= self.max_size
            {
                return;
            }
            let (handle, driver) = connection(
                AnyTransport::for_schema(self.options.schema),
                self.options.clone(),
                PoolLink(Arc::downgrade(self)),
                self.strand.clone(),
                self.read_buffer_size,
            );
            live.insert(handle.id(), handle);
            (driver, live.len())
        };
        debug!(alias = %self.alias(), conn = %driver.id(), live, "opening connection");
        driver.spawn(&self.runtime);
    }

    fn connection_idle(self: &Arc<Self>, id: ConnectionId) {
        let next = {
            let mut idle = self.idle.lock();
            let mut pending = self.pending.lock();
            match pending.pop_front() {
                Some(query) => Next::Dispatch(query),
                None if self.closing.load(Ordering::Acquire) => Next::Terminate,
                None => {
                    idle.push_back(id);
                    Next::Parked
                }
            }
        };

        match next {
            Next::Dispatch(query) => self.dispatch(id, query),
            Next::Terminate => {
                debug!(alias = %self.alias(), conn = %id, "pool closing, terminating idle connection");
                if let Some(handle) = self.live.lock().get(&id) {
                    handle.terminate();
                }
            }
            Next::Parked => debug!(alias = %self.alias(), conn = %id, "connection parked"),
        }
    }

    fn connection_error(self: &Arc<Self>, id: ConnectionId, error: &ConnectionError) {
        let failed: Vec<Query> = {
            let mut idle = self.idle.lock();
            idle.retain(|parked| *parked != id);
            let mut pending = self.pending.lock();
            self.live.lock().remove(&id);
            pending.drain(..).collect()
        };
        warn!(alias = %self.alias(), conn = %id, error = %error, failed = failed.len(), "connection failed, failing queued requests");
        for query in failed {
            self.fail(query, error.clone());
        }
    }

    fn connection_terminated(self: &Arc<Self>, id: ConnectionId) {
        let closing = self.closing.load(Ordering::Acquire);
        let (drained, orphans, regrow) = {
            let mut idle = self.idle.lock();
            idle.retain(|parked| *parked != id);
            let mut pending = self.pending.lock();
            let mut live = self.live.lock();
            live.remove(&id);
            if closing && live.is_empty() {
                (true, pending.drain(..).collect::<Vec<_>>(), false)
            } else {
                (false, Vec::new(), !closing && !pending.is_empty())
            }
        };
        debug!(alias = %self.alias(), conn = %id, "connection terminated");

        for query in orphans {
            self.fail(query, ConnectionError::PoolClosed);
        }
        if drained {
            self.finish_close();
        } else if regrow {
            self.grow();
        }
    }

    fn close(self: &Arc<Self>, on_closed: CloseCallback) {
        let terminate_now = {
            let _idle = self.idle.lock();
            let pending = self.pending.lock();
            if self.closing.swap(true, Ordering::AcqRel) {
                debug!(alias = %self.alias(), "pool already closing");
                return;
            }
            *self.on_closed.lock() = Some(on_closed);
            pending.is_empty()
        };

        if !terminate_now {
            let orphans: Vec<Query> = {
                let _idle = self.idle.lock();
                let mut pending = self.pending.lock();
                if !self.live.lock().is_empty() {
                    info!(alias = %self.alias(), queued = pending.len(), "pool closing, draining queued requests");
                    return;
                }
                pending.drain(..).collect()
            };
            // Nothing left to drain the queue with.
            for query in orphans {
                self.fail(query, ConnectionError::PoolClosed);
            }
            self.finish_close();
            return;
        }
        info!(alias = %self.alias(), "pool closing");
        let handles: Vec<ConnectionHandle> = self.live.lock().values().cloned().collect();
        if handles.is_empty() {
            self.finish_close();
            return;
        }
        for handle in handles {
            handle.terminate();
        }
    }

    fn finish_close(&self) {
        if let Some(on_closed) = self.on_closed.lock().take() {
            info!(alias = %self.alias(), "pool closed");
            self.strand.post(on_closed);
        }
    }

    fn fail(&self, query: Query, error: ConnectionError) {
        let (callbacks, outcome) = query.into_failed(error);
        self.strand.deliver(callbacks, outcome);
    }
}

/// The pool as seen by its connections.
struct PoolLink(Weak<PoolInner>);

impl ConnectionOwner for PoolLink {
    fn connection_idle(&self, id: ConnectionId) {
        if let Some(pool) = self.0.upgrade() {
            pool.connection_idle(id);
        }
    }

    fn connection_error(&self, id: ConnectionId, error: &ConnectionError) {
        if let Some(pool) = self.0.upgrade() {
            pool.connection_error(id, error);
        }
    }

    fn connection_terminated(&self, id: ConnectionId) {
        if let Some(pool) = self.0.upgrade() {
            pool.connection_terminated(id);
        }
    }
}
