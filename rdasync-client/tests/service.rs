mod support;

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use rdasync_client::{
    commands, ClientError, Command, ConnectionError, ConnectionOptions, Error, Request, Service,
    ServiceConfig, Value,
};
use support::{FakeServer, PASSWORD};

const WAIT: Duration = Duration::from_secs(5);

fn service_for(server: &FakeServer, pool_size: usize) -> Service {
    let service = Service::current(ServiceConfig::default()).expect("service");
    service
        .add_connection(ConnectionOptions::tcp("main", server.addr.clone()), Some(pool_size))
        .expect("register");
    service
}

async fn query(service: &Service, command: Command) -> rdasync_client::Result<Value> {
    timeout(WAIT, service.query("main", command))
        .await
        .expect("query timed out")
}

#[tokio::test]
async fn set_then_get_roundtrip() {
    let server = FakeServer::tcp().await;
    let service = service_for(&server, 2);

    let reply = query(&service, commands::set("greeting", "hello")).await.unwrap();
    assert_eq!(reply, Value::string("OK"));
    let reply = query(&service, commands::get("greeting")).await.unwrap();
    assert_eq!(reply, Value::string("hello"));
    let reply = query(&service, commands::get("missing")).await.unwrap();
    assert!(reply.is_nil());
}

#[tokio::test]
async fn handshake_authenticates_and_selects_database() {
    let server = FakeServer::tcp().await;
    let service = Service::current(ServiceConfig::default()).unwrap();
    service
        .add_connection_str(&format!("main=tcp://{}@{}/3", PASSWORD, server.addr), Some(1))
        .unwrap();

    let reply = query(&service, commands::ping(None)).await.unwrap();
    assert_eq!(reply, Value::string("PONG"));
    assert_eq!(
        server.log(),
        vec![format!("AUTH {}", PASSWORD), "SELECT 3".to_string(), "PING".to_string()]
    );
}

#[tokio::test]
async fn rejected_password_fails_the_request() {
    let server = FakeServer::tcp().await;
    let service = Service::current(ServiceConfig::default()).unwrap();
    service
        .add_connection(
            ConnectionOptions::tcp("main", server.addr.clone()).with_password("wrong"),
            Some(1),
        )
        .unwrap();

    let err = query(&service, commands::ping(None)).await.unwrap_err();
    match err.as_connection() {
        Some(ConnectionError::Authentication(message)) => {
            assert!(message.starts_with("WRONGPASS"), "{}", message)
        }
        other => panic!("expected authentication error, got {:?}", other),
    }
}

#[tokio::test]
async fn server_error_keeps_connection_usable() {
    let server = FakeServer::tcp().await;
    let service = service_for(&server, 1);

    let err = query(&service, Command::verb("FAIL")).await.unwrap_err();
    assert_eq!(err.as_query().map(|e| e.message.as_str()), Some("ERR boom"));

    let reply = query(&service, commands::ping(None)).await.unwrap();
    assert_eq!(reply, Value::string("PONG"));
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn peer_close_fails_in_flight_request_and_reconnects() {
    let server = FakeServer::tcp().await;
    let service = service_for(&server, 1);

    let err = query(&service, Command::verb("QUIT")).await.unwrap_err();
    assert_eq!(err.as_connection(), Some(&ConnectionError::ClosedByPeer));

    let reply = query(&service, commands::ping(Some(&b"again"[..]))).await.unwrap();
    assert_eq!(reply, Value::string("again"));
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn slow_reply_times_out() {
    let server = FakeServer::tcp().await;
    let service = Service::current(ServiceConfig::default()).unwrap();
    service
        .add_connection_str(
            &format!("main=tcp://{}?socket_timeout=50ms", server.addr),
            Some(1),
        )
        .unwrap();

    let err = query(&service, Command::verb("SLEEP").arg("1000"))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.as_connection(),
            Some(ConnectionError::Timeout { operation: "reply", .. })
        ),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn batch_replies_come_back_as_one_array() {
    let server = FakeServer::tcp().await;
    let service = service_for(&server, 1);

    let request = Request::batch(vec![
        commands::set("k", "v"),
        commands::get("k"),
        commands::incr("n"),
    ])
    .unwrap();
    let reply = timeout(WAIT, service.query("main", request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        reply,
        Value::Array(vec![Value::string("OK"), Value::string("v"), Value::Integer(1)])
    );

    let failing = Request::batch(vec![Command::verb("FAIL"), commands::ping(None)]).unwrap();
    let err = timeout(WAIT, service.query("main", failing))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.as_query().is_some());

    // Both replies of the failed batch were consumed.
    let reply = query(&service, commands::echo("tail")).await.unwrap();
    assert_eq!(reply, Value::string("tail"));
}

#[tokio::test]
async fn callbacks_run_exactly_once() {
    let server = FakeServer::tcp().await;
    let service = service_for(&server, 1);

    let (tx, rx) = oneshot::channel();
    service
        .execute(
            "main",
            commands::echo("cb"),
            move |value| {
                let _ = tx.send(value);
            },
            |err| panic!("unexpected error: {}", err),
        )
        .unwrap();
    assert_eq!(timeout(WAIT, rx).await.unwrap().unwrap(), Value::string("cb"));

    let (tx, rx) = oneshot::channel();
    service
        .execute(
            "main",
            commands::ping(None),
            |_| panic!("handler blew up"),
            move |err| {
                let _ = tx.send(err);
            },
        )
        .unwrap();
    let err = timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(
        matches!(&err, Error::Client(ClientError::CallbackPanicked(message)) if message.contains("handler blew up")),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn unknown_alias_fails_at_call_site() {
    let service = Service::current(ServiceConfig::default()).unwrap();
    let err = service
        .execute("nope", commands::ping(None), |_| {}, |_| {})
        .unwrap_err();
    assert!(matches!(err, ClientError::UnknownAlias(_)));
    let err = service.query("nope", commands::ping(None)).await.unwrap_err();
    assert!(matches!(err, Error::Client(ClientError::UnknownAlias(_))));
}

#[tokio::test]
async fn stop_drains_queued_requests() {
    let server = FakeServer::tcp().await;
    let service = service_for(&server, 1);

    let mut receivers = Vec::new();
    for _ in 0..5 {
        let (tx, rx) = oneshot::channel();
        service
            .execute(
                "main",
                Command::verb("SLEEP").arg("10"),
                move |value| {
                    let _ = tx.send(Ok(value));
                },
                |err| panic!("queued request failed: {}", err),
            )
            .unwrap();
        receivers.push(rx);
    }
    service.stop();

    for rx in receivers {
        let outcome: Result<Value, ()> = timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap(), Value::string("OK"));
    }
    timeout(WAIT, service.closed()).await.unwrap();
    assert!(!service.is_running());
    assert_eq!(server.accepted(), 1);

    let err = service
        .execute("main", commands::ping(None), |_| {}, |_| {})
        .unwrap_err();
    assert!(matches!(err, ClientError::ServiceStopped));
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_connection() {
    let path = std::env::temp_dir().join(format!("rdasync-test-{}.sock", std::process::id()));
    let server = FakeServer::unix(&path).await;
    let service = Service::current(ServiceConfig::default()).unwrap();
    service
        .add_connection_str(&format!("local=unix://{}", path.display()), Some(1))
        .unwrap();

    let reply = timeout(WAIT, service.query("local", commands::echo("over unix")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Value::string("over unix"));
    assert_eq!(server.accepted(), 1);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn owned_reactor_runs_until_stopped() {
    let server_runtime = tokio::runtime::Runtime::new().unwrap();
    let server = server_runtime.block_on(FakeServer::tcp());

    let service = Service::new(ServiceConfig::default()).unwrap();
    service
        .add_connection(ConnectionOptions::tcp("main", server.addr.clone()), None)
        .unwrap();

    let runner = {
        let service = service.clone();
        thread::spawn(move || service.run())
    };

    let (tx, rx) = std_mpsc::channel();
    for idx in 0..3 {
        let tx = tx.clone();
        let on_error = tx.clone();
        service
            .execute(
                "main",
                commands::echo(format!("msg-{}", idx)),
                move |value| {
                    let _ = tx.send(Ok(value));
                },
                move |err| {
                    let _ = on_error.send(Err(err));
                },
            )
            .unwrap();
    }

    let mut replies = Vec::new();
    for _ in 0..3 {
        let reply = rx.recv_timeout(WAIT).expect("reply").expect("ok reply");
        replies.push(reply.as_str().unwrap_or_default().to_string());
    }
    replies.sort();
    assert_eq!(replies, vec!["msg-0", "msg-1", "msg-2"]);

    service.stop();
    runner.join().unwrap().unwrap();
    assert!(!service.is_running());
}

#[tokio::test]
async fn connections_registered_from_json_config() {
    let server = FakeServer::tcp().await;
    let config: ServiceConfig = serde_json::from_value(serde_json::json!({
        "default_pool_size": 2,
        "connections": [
            { "connection": format!("cfg=tcp://{}@{}/1", PASSWORD, server.addr), "pool_size": 1 }
        ]
    }))
    .unwrap();
    let service = Service::current(config).unwrap();
    assert_eq!(service.aliases(), vec!["cfg".to_string()]);

    let reply = timeout(WAIT, service.query("cfg", commands::echo("from json")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Value::string("from json"));
    assert_eq!(&server.log()[..2], &[format!("AUTH {}", PASSWORD), "SELECT 1".to_string()]);
}
