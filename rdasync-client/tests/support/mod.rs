//! In-process RESP server for integration tests.
//!
//! Understands a handful of Redis commands plus a few test hooks:
//! `SLEEP ms` replies `+OK` after a delay, `FAIL` replies with an error and
//! `QUIT` drops the connection without answering.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use rdasync_client::resp::{self, Parsed, Reply};
use rdasync_client::Value;

pub const PASSWORD: &str = "secret";

#[derive(Default)]
struct State {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    log: Mutex<Vec<String>>,
    accepted: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
}

/// Routes client logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Handle to a running fake server.
#[derive(Clone)]
pub struct FakeServer {
    pub addr: String,
    state: Arc<State>,
}

impl FakeServer {
    /// Binds to an ephemeral TCP port and serves until the runtime stops.
    pub async fn tcp() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let state = Arc::new(State::default());
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });
        FakeServer { addr, state }
    }

    /// Binds a Unix socket at `path`.
    #[cfg(unix)]
    pub async fn unix(path: &std::path::Path) -> Self {
        init_tracing();
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path).expect("bind unix");
        let state = Arc::new(State::default());
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });
        FakeServer {
            addr: path.display().to_string(),
            state,
        }
    }

    /// Every command received so far, arguments joined by spaces.
    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Most connections that were open at the same time.
    pub fn peak_open(&self) -> usize {
        self.state.peak_open.load(Ordering::SeqCst)
    }
}

enum Response {
    Reply(Vec<u8>),
    Delayed(Duration, Vec<u8>),
    Close,
}

async fn serve<S>(mut stream: S, state: Arc<State>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let open = state.open.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_open.fetch_max(open, Ordering::SeqCst);

    let mut buf = BytesMut::with_capacity(1024);
    'conn: loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        loop {
            let args = match resp::parse(&buf) {
                Ok(Parsed {
                    reply: Reply::Value(Value::Array(items)),
                    consumed,
                }) => {
                    buf.advance(consumed);
                    items
                        .into_iter()
                        .map(|item| item.as_bytes().unwrap_or_default().to_vec())
                        .collect::<Vec<_>>()
                }
                Err(err) if err.is_incomplete() => break,
                _ => break 'conn,
            };
            match respond(&state, &args) {
                Response::Reply(bytes) => {
                    if stream.write_all(&bytes).await.is_err() {
                        break 'conn;
                    }
                }
                Response::Delayed(delay, bytes) => {
                    tokio::time::sleep(delay).await;
                    if stream.write_all(&bytes).await.is_err() {
                        break 'conn;
                    }
                }
                Response::Close => break 'conn,
            }
        }
    }

    state.open.fetch_sub(1, Ordering::SeqCst);
}

fn respond(state: &State, args: &[Vec<u8>]) -> Response {
    let line = args
        .iter()
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    state.log.lock().push(line);

    let name = args
        .first()
        .map(|verb| String::from_utf8_lossy(verb).to_ascii_uppercase())
        .unwrap_or_default();
    let arg = |idx: usize| args.get(idx).cloned().unwrap_or_default();

    match name.as_str() {
        "PING" if args.len() > 1 => Response::Reply(bulk(&arg(1))),
        "PING" => Response::Reply(b"+PONG\r\n".to_vec()),
        "ECHO" => Response::Reply(bulk(&arg(1))),
        "AUTH" => {
            if args.last().map(Vec::as_slice) == Some(PASSWORD.as_bytes()) {
                ok()
            } else {
                Response::Reply(b"-WRONGPASS invalid password\r\n".to_vec())
            }
        }
        "SELECT" => ok(),
        "SET" => {
            state.data.lock().insert(arg(1), arg(2));
            ok()
        }
        "GET" => match state.data.lock().get(&arg(1)) {
            Some(value) => Response::Reply(bulk(value)),
            None => Response::Reply(b"$-1\r\n".to_vec()),
        },
        "DEL" => {
            let mut data = state.data.lock();
            let removed = args[1..].iter().filter(|key| data.remove(*key).is_some()).count();
            integer(removed as i64)
        }
        "EXISTS" => {
            let data = state.data.lock();
            integer(args[1..].iter().filter(|key| data.contains_key(*key)).count() as i64)
        }
        "INCR" => {
            let mut data = state.data.lock();
            let entry = data.entry(arg(1)).or_insert_with(|| b"0".to_vec());
            let next = String::from_utf8_lossy(entry).parse::<i64>().unwrap_or(0) + 1;
            *entry = next.to_string().into_bytes();
            integer(next)
        }
        "TTL" => integer(if state.data.lock().contains_key(&arg(1)) { -1 } else { -2 }),
        "EXPIRE" => integer(state.data.lock().contains_key(&arg(1)) as i64),
        "SLEEP" => {
            let ms = String::from_utf8_lossy(&arg(1)).parse().unwrap_or(0);
            Response::Delayed(Duration::from_millis(ms), b"+OK\r\n".to_vec())
        }
        "FAIL" => Response::Reply(b"-ERR boom\r\n".to_vec()),
        "QUIT" => Response::Close,
        _ => Response::Reply(format!("-ERR unknown command '{}'\r\n", name).into_bytes()),
    }
}

fn ok() -> Response {
    Response::Reply(b"+OK\r\n".to_vec())
}

fn integer(value: i64) -> Response {
    Response::Reply(format!(":{}\r\n", value).into_bytes())
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}
