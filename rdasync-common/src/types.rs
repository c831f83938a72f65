//! # Command and Reply Types
//!
//! Purpose: Shared value types flowing between callers, the codec and the
//! connection state machine.
//!
//! ## Design Principles
//! 1. **Immutable Commands**: Arguments are frozen `Bytes` once built, so a
//!    command moves through the pool and the connection without copies.
//! 2. **Binary-Safe Values**: Strings are raw bytes; UTF-8 is opt-in.
//! 3. **Recursive Replies**: Arrays own their children through a `Vec`.
//!
//! ## Wire Shape
//!
//! ```text
//! Command ["PING", "hi"]:
//! *2\r\n $4\r\n PING\r\n $2\r\n hi\r\n
//! ```

use std::fmt;

use bytes::Bytes;

use crate::error::{ClientError, ClientResult};

/// A decoded reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `:` integer reply.
    Integer(i64),
    /// `+` simple string or `$` bulk string.
    String(Bytes),
    /// `$-1` or `*-1`.
    Nil,
    /// `*` array of nested values.
    Array(Vec<Value>),
}

impl Value {
    /// Builds a string value from anything byte-like.
    pub fn string(data: impl AsRef<[u8]>) -> Self {
        Value::String(Bytes::copy_from_slice(data.as_ref()))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the string payload when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|data| std::str::from_utf8(data).ok())
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(value) => write!(f, "(integer) {}", value),
            Value::String(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Value::Nil => write!(f, "(nil)"),
            Value::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Value::Array(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", idx + 1, item)?;
                }
                Ok(())
            }
        }
    }
}

/// One command: a verb followed by its parameters.
///
/// Always holds at least one argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Builds a command, rejecting an empty argument list.
    pub fn new<I, A>(args: I) -> ClientResult<Self>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let args: Vec<Bytes> = args
            .into_iter()
            .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
            .collect();
        Self::from_parts(args)
    }

    /// Builds a command from already-owned arguments.
    pub fn from_parts(args: Vec<Bytes>) -> ClientResult<Self> {
        if args.is_empty() {
            return Err(ClientError::EmptyCommand);
        }
        Ok(Command { args })
    }

    /// Starts a command with just its verb.
    pub fn verb(name: &'static str) -> Self {
        Command {
            args: vec![Bytes::from_static(name.as_bytes())],
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Appends every argument from the iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|arg| Bytes::copy_from_slice(arg.as_ref())));
        self
    }

    /// Verb followed by parameters.
    pub fn as_args(&self) -> &[Bytes] {
        &self.args
    }

    /// Verb as text, for logging.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).into_owned()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Never true for a constructed command.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Unit of work handed to a connection: one command or a batch sent as one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Single(Command),
    Batch(Vec<Command>),
}

impl Request {
    /// Builds a batch, rejecting an empty one.
    pub fn batch(commands: Vec<Command>) -> ClientResult<Self> {
        if commands.is_empty() {
            return Err(ClientError::EmptyBatch);
        }
        Ok(Request::Batch(commands))
    }

    /// Number of replies the server sends back for this request.
    pub fn reply_count(&self) -> usize {
        match self {
            Request::Single(_) => 1,
            Request::Batch(commands) => commands.len(),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Request::Batch(_))
    }

    /// Commands in send order.
    pub fn commands(&self) -> &[Command] {
        match self {
            Request::Single(command) => std::slice::from_ref(command),
            Request::Batch(commands) => commands,
        }
    }
}

impl From<Command> for Request {
    fn from(command: Command) -> Self {
        Request::Single(command)
    }
}
