//! # Typed Client API
//!
//! Purpose: Expose a compact async API for the common key-value commands on
//! top of one alias of a `Service`.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling, framing and reply shapes.
//! 2. **Borrow-Friendly API**: Keys and values are accepted as `AsRef<[u8]>`.
//! 3. **Fail Fast**: Replies of the wrong shape surface as
//!    `ClientError::UnexpectedResponse`.

use std::time::Duration;

use bytes::Bytes;

use rdasync_common::{ClientError, Command, Request, Result, Value};

use crate::commands::{self, SetOptions};
use crate::service::Service;

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Async client bound to one alias of a service.
#[derive(Debug, Clone)]
pub struct Client {
    service: Service,
    alias: String,
}

impl Client {
    /// Binds to `alias`, which must already be registered.
    pub fn new(service: Service, alias: impl Into<String>) -> Result<Self> {
        let alias = alias.into();
        if service.pool(&alias).is_none() {
            return Err(ClientError::UnknownAlias(alias).into());
        }
        Ok(Client { service, alias })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Sends any command and returns the raw reply.
    pub async fn command(&self, command: Command) -> Result<Value> {
        self.service.query(&self.alias, command).await
    }

    /// Sends the commands in one write and returns one reply per command.
    ///
    /// The first server error among the replies fails the whole batch.
    pub async fn batch(&self, commands: Vec<Command>) -> Result<Vec<Value>> {
        let request = Request::batch(commands)?;
        match self.service.query(&self.alias, request).await? {
            Value::Array(values) => Ok(values),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub async fn ping(&self, payload: Option<&[u8]>) -> Result<Bytes> {
        match self.command(commands::ping(payload)).await? {
            Value::String(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    pub async fn echo(&self, message: impl AsRef<[u8]>) -> Result<Bytes> {
        match self.command(commands::echo(message)).await? {
            Value::String(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        match self.command(commands::get(key)).await? {
            Value::String(data) => Ok(Some(data)),
            Value::Nil => Ok(None),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        expect_ok(self.command(commands::set(key, value)).await?)
    }

    /// Sets a value with a millisecond-precision expiration.
    pub async fn set_with_ttl(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        ttl: Duration,
    ) -> Result<()> {
        let options = SetOptions::default().with_ttl(ttl);
        expect_ok(self.command(commands::set_with(key, value, options)).await?)
    }

    /// Conditional `SET`. Returns false when the condition prevented the write.
    pub async fn set_with(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        options: SetOptions,
    ) -> Result<bool> {
        match self.command(commands::set_with(key, value, options)).await? {
            Value::Nil => Ok(false),
            reply => expect_ok(reply).map(|()| true),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let command = commands::del([key])?;
        Ok(integer(self.command(command).await?)? > 0)
    }

    pub async fn exists(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let command = commands::exists([key])?;
        Ok(integer(self.command(command).await?)? > 0)
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub async fn expire(&self, key: impl AsRef<[u8]>, ttl: Duration) -> Result<bool> {
        Ok(integer(self.command(commands::expire(key, ttl)).await?)? == 1)
    }

    /// Returns TTL status for a key.
    pub async fn ttl(&self, key: impl AsRef<[u8]>) -> Result<Ttl> {
        match integer(self.command(commands::ttl(key)).await?)? {
            -2 => Ok(Ttl::Missing),
            -1 => Ok(Ttl::NoExpiry),
            secs if secs >= 0 => Ok(Ttl::ExpiresIn(Duration::from_secs(secs as u64))),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    pub async fn incr(&self, key: impl AsRef<[u8]>) -> Result<i64> {
        integer(self.command(commands::incr(key)).await?)
    }
}

fn integer(reply: Value) -> Result<i64> {
    reply
        .as_integer()
        .ok_or_else(|| ClientError::UnexpectedResponse.into())
}

fn expect_ok(reply: Value) -> Result<()> {
    match reply {
        Value::String(text) if text.as_ref() == b"OK" => Ok(()),
        _ => Err(ClientError::UnexpectedResponse.into()),
    }
}
