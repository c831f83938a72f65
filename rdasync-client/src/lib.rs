//! # rdasync Client
//!
//! Purpose: Provide an asynchronous, pooled client for Redis-compatible
//! servers speaking RESP2, with callback and `async` entry points.
//!
//! ## Design Principles
//! 1. **Sans-IO Core**: The connection state machine only consumes events and
//!    emits actions; the tokio driver owns every socket.
//! 2. **Object Pool Pattern**: Connections are created lazily per alias and
//!    reused across requests.
//! 3. **Serialized Callbacks**: Every caller callback runs on the pool's
//!    strand, never inside a state transition.
//! 4. **Protocol Clarity**: RESP2 is encoded and parsed explicitly in `resp`.
//!
//! ```no_run
//! use rdasync_client::{commands, Service, ServiceConfig};
//!
//! let service = Service::new(ServiceConfig::default())?;
//! service.add_connection_str("main=tcp://127.0.0.1:6379", None)?;
//! let stopper = service.clone();
//! service.execute(
//!     "main",
//!     commands::get("greeting"),
//!     move |value| {
//!         println!("{}", value);
//!         stopper.stop();
//!     },
//!     |err| eprintln!("{}", err),
//! )?;
//! service.run()?;
//! # Ok::<(), rdasync_client::Error>(())
//! ```

pub mod client;
pub mod commands;
pub mod connection;
pub mod fsm;
pub mod pool;
pub mod resp;
pub mod service;
pub mod strand;
pub mod transport;

pub use client::{Client, Ttl};
pub use commands::{SetOptions, UpdateType};
pub use pool::{ConnectionPool, PoolStats};
pub use service::Service;

pub use rdasync_common::*;
