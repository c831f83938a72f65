//! # Service Registry
//!
//! Purpose: Map connection aliases to pools and own the reactor that drives
//! them. This is the entry point callers hold on to.
//!
//! ## Design Principles
//! 1. **Explicit Context**: A `Service` is constructed and passed around; there
//!    is no process-wide instance.
//! 2. **Facade Pattern**: `execute` hides pool lookup, queuing and connection
//!    creation behind one call.
//! 3. **Fail Fast**: Unknown aliases and calls after `stop` return a
//!    `ClientError` at the call site.
//! 4. **Graceful Stop**: `stop` drains every pool; `run`/`closed` return once
//!    the last one reports closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tracing::{debug, info};

use rdasync_common::{
    ClientError, ClientResult, ConnectionOptions, Error, Request, Result, ServiceConfig, Value,
};

use crate::pool::ConnectionPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Stopping,
    Stopped,
}

struct ServiceInner {
    config: ServiceConfig,
    // Present only when the service built its own reactor and `run` is not active.
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    pools: RwLock<HashMap<String, ConnectionPool>>,
    lifecycle: Mutex<Lifecycle>,
    stopped: watch::Sender<bool>,
}

/// Registry of connection pools plus the reactor that drives them.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Creates a service with its own single-threaded reactor.
    ///
    /// Nothing makes progress until `run` is called.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClientError::Reactor)?;
        let handle = runtime.handle().clone();
        Self::build(config, Some(runtime), handle)
    }

    /// Creates a service driven by an existing tokio runtime.
    pub fn with_handle(handle: Handle, config: ServiceConfig) -> Result<Self> {
        Self::build(config, None, handle)
    }

    /// Creates a service on the runtime of the calling task.
    pub fn current(config: ServiceConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| ClientError::NoReactor)?;
        Self::with_handle(handle, config)
    }

    fn build(config: ServiceConfig, runtime: Option<Runtime>, handle: Handle) -> Result<Self> {
        if config.default_pool_size == 0 {
            return Err(ClientError::InvalidPoolSize.into());
        }
        let (stopped, _) = watch::channel(false);
        let service = Service {
            inner: Arc::new(ServiceInner {
                config,
                runtime: Mutex::new(runtime),
                handle,
                pools: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::Running),
                stopped,
            }),
        };
        for spec in &service.inner.config.connections {
            service.add_connection(spec.options()?, spec.pool_size)?;
        }
        info!(pools = service.inner.pools.read().len(), "service started");
        Ok(service)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Handle of the reactor driving this service.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle.lock() == Lifecycle::Running
    }

    /// Registers a pool for `options.alias`.
    ///
    /// Registering an alias that already exists returns the existing pool.
    pub fn add_connection(
        &self,
        options: ConnectionOptions,
        pool_size: Option<usize>,
    ) -> Result<ConnectionPool> {
        self.ensure_running()?;
        options.validate()?;

        let mut pools = self.inner.pools.write();
        if let Some(pool) = pools.get(&options.alias) {
            debug!(alias = %options.alias, "alias already registered");
            return Ok(pool.clone());
        }
        let alias = options.alias.clone();
        let pool = ConnectionPool::new(
            options,
            pool_size.unwrap_or(self.inner.config.default_pool_size),
            self.inner.config.read_buffer_size,
            self.inner.handle.clone(),
        )?;
        pools.insert(alias, pool.clone());
        Ok(pool)
    }

    /// Parses `alias=schema://...` and registers it.
    pub fn add_connection_str(
        &self,
        connection: &str,
        pool_size: Option<usize>,
    ) -> Result<ConnectionPool> {
        self.add_connection(ConnectionOptions::parse(connection)?, pool_size)
    }

    pub fn pool(&self, alias: &str) -> Option<ConnectionPool> {
        self.inner.pools.read().get(alias).cloned()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.inner.pools.read().keys().cloned().collect()
    }

    /// Sends `request` through the pool for `alias`.
    ///
    /// Exactly one of the callbacks runs, later, on the pool's strand. Misuse
    /// (unknown alias, stopped service) is reported here instead.
    pub fn execute<R, E>(
        &self,
        alias: &str,
        request: impl Into<Request>,
        on_result: R,
        on_error: E,
    ) -> ClientResult<()>
    where
        R: FnOnce(Value) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        let pool = self.lookup(alias)?;
        pool.execute(request, on_result, on_error);
        Ok(())
    }

    /// Async form of `execute`.
    pub async fn query(&self, alias: &str, request: impl Into<Request>) -> Result<Value> {
        let pool = self.lookup(alias)?;
        pool.query(request).await
    }

    fn lookup(&self, alias: &str) -> ClientResult<ConnectionPool> {
        self.ensure_running()?;
        self.pool(alias)
            .ok_or_else(|| ClientError::UnknownAlias(alias.to_string()))
    }

    fn ensure_running(&self) -> ClientResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ClientError::ServiceStopped)
        }
    }

    /// Drives the owned reactor until `stop` has drained every pool.
    ///
    /// Fails with `NoReactor` for services built on an external runtime, or
    /// while another thread is already running it.
    pub fn run(&self) -> ClientResult<()> {
        let runtime = self
            .inner
            .runtime
            .lock()
            .take()
            .ok_or(ClientError::NoReactor)?;
        info!("service running");
        runtime.block_on(self.closed());
        *self.inner.runtime.lock() = Some(runtime);
        info!("service stopped");
        Ok(())
    }

    /// Closes every pool. Queued requests still complete. Idempotent.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle != Lifecycle::Running {
                return;
            }
            *lifecycle = Lifecycle::Stopping;
        }

        let pools: Vec<ConnectionPool> = self.inner.pools.read().values().cloned().collect();
        info!(pools = pools.len(), "service stopping");
        if pools.is_empty() {
            self.inner.mark_stopped();
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(pools.len()));
        for pool in pools {
            let remaining = remaining.clone();
            let inner = self.inner.clone();
            let alias = pool.alias().to_string();
            pool.close(move || {
                debug!(alias = %alias, "pool drained");
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    inner.mark_stopped();
                }
            });
        }
    }

    /// Resolves once `stop` has drained every pool.
    pub async fn closed(&self) {
        let mut rx = self.inner.stopped.subscribe();
        // Err only if the sender is gone, which cannot happen while `self` lives.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl ServiceInner {
    fn mark_stopped(&self) {
        *self.lifecycle.lock() = Lifecycle::Stopped;
        self.stopped.send_replace(true);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("lifecycle", &*self.inner.lifecycle.lock())
            .field("aliases", &self.aliases())
            .finish()
    }
}
