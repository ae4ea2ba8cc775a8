//! End-to-end basics over a real socket: ping, reads and writes, databases,
//! auth, TTL, and protocol errors.

mod common;

use std::sync::atomic::Ordering;

use common::{start_server, test_config, RespClient};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_then_info_reports_one_command() {
    let (server, addr) = start_server(test_config("ping-info", 3));
    let mut client = RespClient::connect(addr).await;

    assert_eq!(client.cmd(&["PING"]).await.simple(), "PONG");

    let info = client.cmd(&["INFO"]).await.bulk_string();
    assert!(info.contains("total_commands_processed:1\r\n"), "info:\n{info}");
    assert!(info.contains("kvstore_count:3\r\n"));
    assert!(info.contains("connected_clients:1\r\n"));
    assert!(info.contains("role:master\r\n"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_get_del_roundtrip() {
    let (server, addr) = start_server(test_config("set-get", 3));
    let mut client = RespClient::connect(addr).await;

    assert_eq!(client.cmd(&["SET", "x", "1"]).await.simple(), "OK");
    assert_eq!(client.cmd(&["GET", "x"]).await.bulk_string(), "1");
    assert_eq!(server.stat().keyspace_hits.load(Ordering::Relaxed), 1);

    assert_eq!(client.cmd(&["EXISTS", "x", "y"]).await.int(), 1);
    assert_eq!(client.cmd(&["DBSIZE"]).await.int(), 1);
    assert_eq!(client.cmd(&["DEL", "x", "y"]).await.int(), 1);
    assert_eq!(client.cmd(&["GET", "x"]).await.bulk(), None);
    assert_eq!(server.stat().keyspace_misses.load(Ordering::Relaxed), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn select_isolates_logical_databases() {
    let (server, addr) = start_server(test_config("select", 3));
    let mut client = RespClient::connect(addr).await;

    assert_eq!(client.cmd(&["SET", "k", "db0"]).await.simple(), "OK");
    assert_eq!(client.cmd(&["SELECT", "1"]).await.simple(), "OK");
    assert_eq!(client.cmd(&["GET", "k"]).await.bulk(), None);
    assert_eq!(client.cmd(&["SET", "k", "db1"]).await.simple(), "OK");
    assert_eq!(client.cmd(&["GET", "k"]).await.bulk_string(), "db1");
    assert_eq!(client.cmd(&["DBSIZE"]).await.int(), 1);

    let err = client.cmd(&["SELECT", "99"]).await.error();
    assert!(err.contains("out of range"), "{err}");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auth_gates_commands() {
    let mut cfg = test_config("auth", 2);
    cfg.requirepass = "sesame".to_string();
    let (server, addr) = start_server(cfg);
    let mut client = RespClient::connect(addr).await;

    let err = client.cmd(&["GET", "k"]).await.error();
    assert!(err.starts_with("NOAUTH"), "{err}");

    let err = client.cmd(&["AUTH", "wrong"]).await.error();
    assert!(err.contains("invalid password"), "{err}");

    assert_eq!(client.cmd(&["AUTH", "sesame"]).await.simple(), "OK");
    assert_eq!(client.cmd(&["GET", "k"]).await.bulk(), None);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn px_expiry_hides_the_key() {
    let (server, addr) = start_server(test_config("expiry", 2));
    let mut client = RespClient::connect(addr).await;

    assert_eq!(
        client.cmd(&["SET", "tmp", "v", "PX", "30"]).await.simple(),
        "OK"
    );
    assert_eq!(client.cmd(&["GET", "tmp"]).await.bulk_string(), "v");
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert_eq!(client.cmd(&["GET", "tmp"]).await.bulk(), None);

    assert_eq!(
        client.cmd(&["SET", "keep", "v", "EX", "100"]).await.simple(),
        "OK"
    );
    assert_eq!(client.cmd(&["GET", "keep"]).await.bulk_string(), "v");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quit_closes_after_reply() {
    let (server, addr) = start_server(test_config("quit", 2));
    let mut client = RespClient::connect(addr).await;

    assert_eq!(client.cmd(&["QUIT"]).await.simple(), "OK");
    assert_eq!(client.try_read_line().await, None);

    common::wait_until(|| server.session_count() == 0, "session to end").await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn protocol_and_precheck_errors_reply_inline() {
    let (server, addr) = start_server(test_config("errors", 2));
    let mut client = RespClient::connect(addr).await;

    let err = client.cmd(&["FROBNICATE"]).await.error();
    assert!(err.contains("unknown command"), "{err}");

    let err = client.cmd(&["GET"]).await.error();
    assert!(err.contains("wrong number of arguments"), "{err}");

    // Precheck failures still keep the session usable.
    assert_eq!(client.cmd(&["PING"]).await.simple(), "PONG");

    server.stop().await;
}
