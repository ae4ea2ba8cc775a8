//! Store lifecycle admin surface: pause, destroy, and mode persistence.

mod common;

use common::{start_server, test_config, RespClient};
use shale_store::store::StoreMode;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroystore_requires_empty_then_paused() {
    let (server, addr) = start_server(test_config("destroy-cmd", 3));
    server.store(2).unwrap().set(b"k", b"v", None).unwrap();

    let mut client = RespClient::connect(addr).await;

    // Non-empty and not forced: refused, catalog untouched.
    let err = client.cmd(&["DESTROYSTORE", "2"]).await.error();
    assert!(err.contains("try to close an unempty store"), "{err}");
    assert_eq!(server.store(2).unwrap().get_mode(), StoreMode::ReadWrite);

    // Forced but not paused: refused.
    let err = client.cmd(&["DESTROYSTORE", "2", "force"]).await.error();
    assert!(err.contains("pausestore first"), "{err}");

    assert_eq!(client.cmd(&["PAUSESTORE", "2"]).await.simple(), "OK");
    assert_eq!(
        client.cmd(&["DESTROYSTORE", "2", "force"]).await.simple(),
        "OK"
    );
    assert_eq!(server.store(2).unwrap().get_mode(), StoreMode::StoreNone);
    assert_eq!(server.repl_mgr().unwrap().replica_count(2), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroyed_store_stays_destroyed_across_restart() {
    let cfg = test_config("destroy-restart", 3);
    {
        let (server, addr) = start_server(cfg.clone());
        let mut client = RespClient::connect(addr).await;
        assert_eq!(client.cmd(&["PAUSESTORE", "1"]).await.simple(), "OK");
        assert_eq!(client.cmd(&["DESTROYSTORE", "1"]).await.simple(), "OK");
        server.stop().await;
    }
    {
        let (server, _) = start_server(cfg);
        assert_eq!(server.store(1).unwrap().get_mode(), StoreMode::StoreNone);
        assert_eq!(server.store(0).unwrap().get_mode(), StoreMode::ReadWrite);
        server.stop().await;
    }
}
