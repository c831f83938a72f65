//! # Strand: Ordered Callback Delivery
//!
//! Purpose: Run caller callbacks on a serial task so they never execute on the
//! caller's stack or inside a connection's state transition.
//!
//! ## Design Principles
//! 1. **Serial Execution**: Jobs run one at a time in submission order.
//! 2. **Panic Containment**: A panicking result callback is turned into a call
//!    of its error callback; other panics are logged and dropped.
//! 3. **Exactly Once**: `Callbacks` is consumed by `resolve`, so a request can
//!    only ever be answered once.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use rdasync_common::{ClientError, Error, Result, Value};

/// Receives the reply value.
pub type ResultCallback = Box<dyn FnOnce(Value) + Send + 'static>;

/// Receives the error a request resolved with.
pub type ErrorCallback = Box<dyn FnOnce(Error) + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serial executor backed by one spawned task.
#[derive(Clone)]
pub struct Strand {
    tx: mpsc::UnboundedSender<Job>,
}

impl Strand {
    /// Spawns the executor task on `runtime`.
    pub fn new(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                run_guarded(job);
            }
        });
        Strand { tx }
    }

    /// Queues `job` behind every job posted before it.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Box::new(job)) {
            // The runtime is gone; nothing else will ever run the job.
            debug!("strand closed, running job inline");
            run_guarded(job);
        }
    }

    /// Resolves `callbacks` with `outcome` on the strand.
    pub fn deliver(&self, callbacks: Callbacks, outcome: Result<Value>) {
        self.post(move || callbacks.resolve(outcome));
    }
}

impl fmt::Debug for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strand")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

fn run_guarded(job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        warn!(panic = %panic_message(panic.as_ref()), "strand job panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Where the outcome of one request goes.
pub enum Callbacks {
    /// A result and an error callback; exactly one of them runs.
    Split {
        on_result: ResultCallback,
        on_error: ErrorCallback,
    },
    /// A oneshot channel, used by the async API.
    Channel(oneshot::Sender<Result<Value>>),
}

impl Callbacks {
    pub fn new<R, E>(on_result: R, on_error: E) -> Self
    where
        R: FnOnce(Value) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        Callbacks::Split {
            on_result: Box::new(on_result),
            on_error: Box::new(on_error),
        }
    }

    /// Callbacks that forward the outcome into the returned receiver.
    pub fn channel() -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Callbacks::Channel(tx), rx)
    }

    /// Invokes the matching callback. Runs on the strand.
    pub fn resolve(self, outcome: Result<Value>) {
        match self {
            Callbacks::Split {
                on_result,
                on_error,
            } => match outcome {
                Ok(value) => {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(move || on_result(value))) {
                        let message = panic_message(panic.as_ref());
                        warn!(panic = %message, "result callback panicked");
                        invoke_error(on_error, ClientError::CallbackPanicked(message).into());
                    }
                }
                Err(err) => invoke_error(on_error, err),
            },
            Callbacks::Channel(tx) => {
                // The receiver may have given up waiting.
                let _ = tx.send(outcome);
            }
        }
    }
}

fn invoke_error(on_error: ErrorCallback, err: Error) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(move || on_error(err))) {
        warn!(panic = %panic_message(panic.as_ref()), "error callback panicked");
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callbacks::Split { .. } => f.write_str("Callbacks::Split"),
            Callbacks::Channel(_) => f.write_str("Callbacks::Channel"),
        }
    }
}
