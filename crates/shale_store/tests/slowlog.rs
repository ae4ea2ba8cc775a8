//! Slow-log recording plus the DEBUG observability subcommands.

mod common;

use common::{start_server, test_config, RespClient};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_commands_are_recorded_with_contiguous_ids() {
    let mut cfg = test_config("slowlog", 2);
    cfg.slowlog_slower_than_us = 1000;
    let slowlog_path = cfg.slowlog_path.clone();
    let (server, addr) = start_server(cfg);
    let mut client = RespClient::connect(addr).await;

    // Well above the 1 ms threshold.
    assert_eq!(client.cmd(&["DEBUG", "sleep", "5"]).await.simple(), "OK");
    assert_eq!(server.slowlog_id(), 1);

    // Fast commands stay out of the log.
    assert_eq!(client.cmd(&["PING"]).await.simple(), "PONG");
    assert_eq!(server.slowlog_id(), 1);

    assert_eq!(client.cmd(&["DEBUG", "sleep", "3"]).await.simple(), "OK");
    assert_eq!(server.slowlog_id(), 2);

    server.stop().await;

    let body = std::fs::read_to_string(&slowlog_path).unwrap();
    assert!(body.contains("#Id: 0\n"), "slowlog:\n{body}");
    assert!(body.contains("#Id: 1\n"), "slowlog:\n{body}");
    assert!(body.contains("#Query_time: "), "slowlog:\n{body}");
    assert!(body.contains("DEBUG sleep 5 \n"), "slowlog:\n{body}");
    assert!(body.contains("#argc: 3\n"), "slowlog:\n{body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn debug_jsonstat_and_storestats() {
    let (server, addr) = start_server(test_config("jsonstat", 2));
    let mut client = RespClient::connect(addr).await;
    assert_eq!(client.cmd(&["SET", "k", "v"]).await.simple(), "OK");

    let raw = client
        .cmd(&["DEBUG", "jsonstat", "network,request,req_pool"])
        .await
        .bulk_string();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(v["network"]["conn_created"], 1);
    assert!(v["request"]["processed"].as_u64().unwrap() >= 1);
    assert!(v["req_pool"]["executed"].as_u64().unwrap() >= 1);

    let stats = client
        .cmd(&["DEBUG", "storestats", "shale.writes"])
        .await
        .bulk_string();
    assert!(stats.contains("store_0:"), "{stats}");
    assert!(stats.contains("store_1:"), "{stats}");

    assert_eq!(client.cmd(&["DEBUG", "resetstores"]).await.simple(), "OK");
    assert_eq!(client.cmd(&["DEBUG", "ftmc", "on"]).await.simple(), "OK");
    assert_eq!(client.cmd(&["DEBUG", "reset-stats"]).await.simple(), "OK");

    server.stop().await;
}
