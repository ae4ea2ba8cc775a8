//! Replication hijack: FULLSYNC / INCRSYNC take the socket away from the
//! session framework and hand it to the replication manager.

mod common;

use std::sync::atomic::Ordering;

use common::{start_server, test_config, wait_until, RespClient};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn incrsync_registers_a_replica_and_detaches_the_socket() {
    let (server, addr) = start_server(test_config("incrsync-ok", 3));
    server.store(0).unwrap().set(b"a", b"1", None).unwrap();
    server.store(0).unwrap().set(b"b", b"2", None).unwrap();

    let mut replica = RespClient::connect(addr).await;
    replica
        .send(&["INCRSYNC", "0", "0", "1", "127.0.0.1", "7001"])
        .await;

    // The replication manager acknowledges from its own task.
    assert_eq!(replica.read_line().await, "+OK");
    let ping = replica.read_line().await;
    assert!(ping.starts_with("+PING "), "ping: {ping}");

    assert_eq!(server.stat().sync_partial_ok.load(Ordering::Relaxed), 1);
    assert_eq!(server.stat().sync_partial_err.load(Ordering::Relaxed), 0);
    assert_eq!(server.repl_mgr().unwrap().replica_count(0), 1);

    // The session framework no longer owns the socket.
    wait_until(|| server.session_count() == 0, "session detach").await;

    // Another client still sees the counters through INFO.
    let mut client = RespClient::connect(addr).await;
    let info = client.cmd(&["INFO"]).await.bulk_string();
    assert!(info.contains("sync_partial_ok:1\r\n"), "info:\n{info}");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn incrsync_rejects_a_position_ahead_of_master() {
    let (server, addr) = start_server(test_config("incrsync-ahead", 3));

    let mut replica = RespClient::connect(addr).await;
    replica
        .send(&["INCRSYNC", "0", "0", "999999", "127.0.0.1", "7002"])
        .await;

    // Registration fails; the borrowed socket is simply dropped.
    assert_eq!(replica.try_read_line().await, None);
    wait_until(
        || server.stat().sync_partial_err.load(Ordering::Relaxed) == 1,
        "sync_partial_err",
    )
    .await;
    assert_eq!(server.stat().sync_partial_ok.load(Ordering::Relaxed), 0);
    assert_eq!(server.repl_mgr().unwrap().replica_count(0), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fullsync_streams_a_snapshot() {
    let (server, addr) = start_server(test_config("fullsync", 3));
    let store = server.store(1).unwrap();
    store.set(b"k1", b"v1", None).unwrap();
    store.set(b"k2", b"v2", None).unwrap();

    let mut replica = RespClient::connect(addr).await;
    replica.send(&["FULLSYNC", "1", "0", "0"]).await;

    // Snapshot: an array of alternating key/value bulks, then an end marker
    // carrying the replication position.
    let header = replica.read_line().await;
    assert_eq!(header, "*4");
    let mut seen = Vec::new();
    for _ in 0..4 {
        let len_line = replica.read_line().await;
        assert!(len_line.starts_with('$'), "{len_line}");
        seen.push(replica.read_line().await);
    }
    assert!(seen.contains(&"k1".to_string()), "{seen:?}");
    assert!(seen.contains(&"v2".to_string()), "{seen:?}");

    let end = replica.read_line().await;
    assert_eq!(end, "+FULLSYNC-END 2");

    assert_eq!(server.stat().sync_full.load(Ordering::Relaxed), 1);
    wait_until(|| server.session_count() == 0, "session detach").await;

    server.stop().await;
}
