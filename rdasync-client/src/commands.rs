//! # Command Builders
//!
//! Purpose: Typed constructors for the commands callers reach for most, so
//! argument order and option keywords are written in one place.
//!
//! Variadic builders reject an empty argument list with
//! `ClientError::EmptyArguments` instead of sending a command the server would
//! refuse anyway.

use std::time::Duration;

use rdasync_common::{ClientError, ClientResult, Command};

/// Write condition for `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateType {
    /// Write unconditionally.
    #[default]
    Always,
    /// Only overwrite an existing key (`XX`).
    Exist,
    /// Only create a missing key (`NX`).
    NotExist,
}

/// Optional clauses for `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetOptions {
    /// Expiry, sent with millisecond precision (`PX`).
    pub ttl: Option<Duration>,
    pub update: UpdateType,
}

impl SetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn only_if(mut self, update: UpdateType) -> Self {
        self.update = update;
        self
    }
}

pub fn ping(payload: Option<&[u8]>) -> Command {
    match payload {
        Some(data) => Command::verb("PING").arg(data),
        None => Command::verb("PING"),
    }
}

pub fn echo(message: impl AsRef<[u8]>) -> Command {
    Command::verb("ECHO").arg(message)
}

/// `AUTH [user] password`.
pub fn auth(user: Option<&str>, password: &str) -> Command {
    let command = Command::verb("AUTH");
    match user {
        Some(user) => command.arg(user).arg(password),
        None => command.arg(password),
    }
}

pub fn select(database: u32) -> Command {
    Command::verb("SELECT").arg(database.to_string())
}

pub fn get(key: impl AsRef<[u8]>) -> Command {
    Command::verb("GET").arg(key)
}

pub fn set(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Command {
    Command::verb("SET").arg(key).arg(value)
}

/// `SET key value [PX ms] [XX|NX]`.
pub fn set_with(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, options: SetOptions) -> Command {
    let mut command = set(key, value);
    if let Some(ttl) = options.ttl {
        command = command.arg("PX").arg(ttl.as_millis().to_string());
    }
    match options.update {
        UpdateType::Always => command,
        UpdateType::Exist => command.arg("XX"),
        UpdateType::NotExist => command.arg("NX"),
    }
}

pub fn mget<I, K>(keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("MGET", Command::verb("MGET"), keys)
}

pub fn mset<I, K, V>(pairs: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut command = Command::verb("MSET");
    for (key, value) in pairs {
        command = command.arg(key).arg(value);
    }
    non_empty("MSET", command, 1)
}

pub fn del<I, K>(keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("DEL", Command::verb("DEL"), keys)
}

pub fn exists<I, K>(keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("EXISTS", Command::verb("EXISTS"), keys)
}

/// `EXPIRE key seconds`; sub-second precision is truncated.
pub fn expire(key: impl AsRef<[u8]>, ttl: Duration) -> Command {
    Command::verb("EXPIRE").arg(key).arg(ttl.as_secs().to_string())
}

pub fn pexpire(key: impl AsRef<[u8]>, ttl: Duration) -> Command {
    Command::verb("PEXPIRE").arg(key).arg(ttl.as_millis().to_string())
}

pub fn ttl(key: impl AsRef<[u8]>) -> Command {
    Command::verb("TTL").arg(key)
}

pub fn pttl(key: impl AsRef<[u8]>) -> Command {
    Command::verb("PTTL").arg(key)
}

pub fn rename(key: impl AsRef<[u8]>, new_key: impl AsRef<[u8]>) -> Command {
    Command::verb("RENAME").arg(key).arg(new_key)
}

pub fn incr(key: impl AsRef<[u8]>) -> Command {
    Command::verb("INCR").arg(key)
}

pub fn incrby(key: impl AsRef<[u8]>, delta: i64) -> Command {
    Command::verb("INCRBY").arg(key).arg(delta.to_string())
}

pub fn hset(key: impl AsRef<[u8]>, field: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Command {
    Command::verb("HSET").arg(key).arg(field).arg(value)
}

pub fn hget(key: impl AsRef<[u8]>, field: impl AsRef<[u8]>) -> Command {
    Command::verb("HGET").arg(key).arg(field)
}

pub fn hdel<I, F>(key: impl AsRef<[u8]>, fields: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    variadic("HDEL", Command::verb("HDEL").arg(key), fields)
}

pub fn hkeys(key: impl AsRef<[u8]>) -> Command {
    Command::verb("HKEYS").arg(key)
}

pub fn hmget<I, F>(key: impl AsRef<[u8]>, fields: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    variadic("HMGET", Command::verb("HMGET").arg(key), fields)
}

pub fn hmset<I, F, V>(key: impl AsRef<[u8]>, pairs: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = (F, V)>,
    F: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut command = Command::verb("HMSET").arg(key);
    for (field, value) in pairs {
        command = command.arg(field).arg(value);
    }
    non_empty("HMSET", command, 2)
}

pub fn lpush<I, V>(key: impl AsRef<[u8]>, values: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = V>,
    V: AsRef<[u8]>,
{
    variadic("LPUSH", Command::verb("LPUSH").arg(key), values)
}

pub fn rpush<I, V>(key: impl AsRef<[u8]>, values: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = V>,
    V: AsRef<[u8]>,
{
    variadic("RPUSH", Command::verb("RPUSH").arg(key), values)
}

pub fn lpop(key: impl AsRef<[u8]>) -> Command {
    Command::verb("LPOP").arg(key)
}

pub fn rpop(key: impl AsRef<[u8]>) -> Command {
    Command::verb("RPOP").arg(key)
}

pub fn llen(key: impl AsRef<[u8]>) -> Command {
    Command::verb("LLEN").arg(key)
}

/// `LRANGE key start stop`; negative indexes count from the tail.
pub fn lrange(key: impl AsRef<[u8]>, start: i64, stop: i64) -> Command {
    Command::verb("LRANGE")
        .arg(key)
        .arg(start.to_string())
        .arg(stop.to_string())
}

pub fn lindex(key: impl AsRef<[u8]>, index: i64) -> Command {
    Command::verb("LINDEX").arg(key).arg(index.to_string())
}

/// `LREM key count value`; the sign of `count` picks the scan direction.
pub fn lrem(key: impl AsRef<[u8]>, count: i64, value: impl AsRef<[u8]>) -> Command {
    Command::verb("LREM").arg(key).arg(count.to_string()).arg(value)
}

pub fn lset(key: impl AsRef<[u8]>, index: i64, value: impl AsRef<[u8]>) -> Command {
    Command::verb("LSET").arg(key).arg(index.to_string()).arg(value)
}

pub fn ltrim(key: impl AsRef<[u8]>, start: i64, stop: i64) -> Command {
    Command::verb("LTRIM")
        .arg(key)
        .arg(start.to_string())
        .arg(stop.to_string())
}

pub fn sadd<I, M>(key: impl AsRef<[u8]>, members: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = M>,
    M: AsRef<[u8]>,
{
    variadic("SADD", Command::verb("SADD").arg(key), members)
}

pub fn srem<I, M>(key: impl AsRef<[u8]>, members: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = M>,
    M: AsRef<[u8]>,
{
    variadic("SREM", Command::verb("SREM").arg(key), members)
}

pub fn smembers(key: impl AsRef<[u8]>) -> Command {
    Command::verb("SMEMBERS").arg(key)
}

pub fn scard(key: impl AsRef<[u8]>) -> Command {
    Command::verb("SCARD").arg(key)
}

pub fn spop(key: impl AsRef<[u8]>) -> Command {
    Command::verb("SPOP").arg(key)
}

pub fn sdiff<I, K>(keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("SDIFF", Command::verb("SDIFF"), keys)
}

pub fn sinter<I, K>(keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("SINTER", Command::verb("SINTER"), keys)
}

pub fn sunion<I, K>(keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("SUNION", Command::verb("SUNION"), keys)
}

/// `SDIFFSTORE destination key...`
pub fn sdiffstore<I, K>(destination: impl AsRef<[u8]>, keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("SDIFFSTORE", Command::verb("SDIFFSTORE").arg(destination), keys)
}

pub fn sinterstore<I, K>(destination: impl AsRef<[u8]>, keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("SINTERSTORE", Command::verb("SINTERSTORE").arg(destination), keys)
}

pub fn sunionstore<I, K>(destination: impl AsRef<[u8]>, keys: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    variadic("SUNIONSTORE", Command::verb("SUNIONSTORE").arg(destination), keys)
}

fn variadic<I, A>(name: &'static str, head: Command, args: I) -> ClientResult<Command>
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let fixed = head.len();
    non_empty(name, head.args(args), fixed)
}

fn non_empty(name: &'static str, command: Command, fixed: usize) -> ClientResult<Command> {
    if command.len() > fixed {
        Ok(command)
    } else {
        Err(ClientError::EmptyArguments(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(command: &Command) -> Vec<&[u8]> {
        command.as_args().iter().map(|arg| arg.as_ref()).collect()
    }

    #[test]
    fn set_with_options() {
        let options = SetOptions::default()
            .with_ttl(Duration::from_millis(1500))
            .only_if(UpdateType::NotExist);
        let command = set_with("k", "v", options);
        assert_eq!(
            words(&command),
            vec![&b"SET"[..], b"k", b"v", b"PX", b"1500", b"NX"]
        );

        let plain = set_with("k", "v", SetOptions::default());
        assert_eq!(words(&plain), vec![&b"SET"[..], b"k", b"v"]);

        let existing = set_with("k", "v", SetOptions::default().only_if(UpdateType::Exist));
        assert_eq!(words(&existing).last(), Some(&&b"XX"[..]));
    }

    #[test]
    fn auth_with_and_without_user() {
        assert_eq!(words(&auth(None, "pw")), vec![&b"AUTH"[..], b"pw"]);
        assert_eq!(
            words(&auth(Some("app"), "pw")),
            vec![&b"AUTH"[..], b"app", b"pw"]
        );
    }

    #[test]
    fn variadic_builders_need_arguments() {
        let none: Vec<&str> = Vec::new();
        assert!(matches!(
            del(none.clone()),
            Err(ClientError::EmptyArguments("DEL"))
        ));
        assert!(matches!(
            hdel("h", none.clone()),
            Err(ClientError::EmptyArguments("HDEL"))
        ));
        assert!(matches!(
            mset(Vec::<(&str, &str)>::new()),
            Err(ClientError::EmptyArguments("MSET"))
        ));

        let command = rpush("list", ["a", "b"]).unwrap();
        assert_eq!(words(&command), vec![&b"RPUSH"[..], b"list", b"a", b"b"]);
    }

    #[test]
    fn numeric_arguments_are_decimal() {
        assert_eq!(
            words(&lrange("l", 0, -1)),
            vec![&b"LRANGE"[..], b"l", b"0", b"-1"]
        );
        assert_eq!(
            words(&expire("k", Duration::from_millis(2999))),
            vec![&b"EXPIRE"[..], b"k", b"2"]
        );
        assert_eq!(words(&select(7)), vec![&b"SELECT"[..], b"7"]);
        assert_eq!(
            words(&mset([("a", "1"), ("b", "2")]).unwrap()),
            vec![&b"MSET"[..], b"a", b"1", b"b", b"2"]
        );
    }

    #[test]
    fn list_and_set_builders() {
        assert_eq!(
            words(&lrem("l", -2, "x")),
            vec![&b"LREM"[..], b"l", b"-2", b"x"]
        );
        assert_eq!(
            words(&ltrim("l", 1, 3)),
            vec![&b"LTRIM"[..], b"l", b"1", b"3"]
        );
        assert_eq!(
            words(&hmset("h", [("f", "1"), ("g", "2")]).unwrap()),
            vec![&b"HMSET"[..], b"h", b"f", b"1", b"g", b"2"]
        );
        assert!(matches!(
            hmset("h", Vec::<(&str, &str)>::new()),
            Err(ClientError::EmptyArguments("HMSET"))
        ));
        assert_eq!(
            words(&sinterstore("dst", ["a", "b"]).unwrap()),
            vec![&b"SINTERSTORE"[..], b"dst", b"a", b"b"]
        );
        assert!(matches!(
            sunionstore("dst", Vec::<&str>::new()),
            Err(ClientError::EmptyArguments("SUNIONSTORE"))
        ));
        assert_eq!(words(&sdiff(["a"]).unwrap()), vec![&b"SDIFF"[..], b"a"]);
    }
}
