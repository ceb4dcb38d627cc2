//! Process-wide `invoke` entry point.
//!
//! Kept in its own test binary: the global cache is created once per process.

use serde_json::json;
use sockrpc::server::services;
use sockrpc::{HandlerRegistry, RpcConfig, RpcError, RpcServer};
use std::time::Duration;

#[tokio::test]
async fn test_global_invoke_and_dump_state() {
    let registry = HandlerRegistry::new();
    services::register_echo(&registry);
    let server = RpcServer::bind(RpcConfig::default(), registry)
        .await
        .unwrap()
        .spawn();

    sockrpc::client::init_global(RpcConfig::default().with_socket_timeout(Duration::from_secs(2)))
        .unwrap();
    let again = sockrpc::client::init_global(RpcConfig::default());
    assert!(matches!(again, Err(RpcError::Config(_))));

    let value = sockrpc::invoke(
        "127.0.0.1",
        server.port(),
        "echo",
        "echo",
        json!({"payload": "hi"}),
        None,
    )
    .await
    .unwrap();
    assert_eq!(value, json!({"payload": "hi"}));

    let dump = sockrpc::client::dump_state().await;
    assert!(dump.contains(&format!("Socket '127.0.0.1:{}'", server.port())), "{}", dump);

    sockrpc::client::global().shutdown().await;
    server.shutdown().await.unwrap();
}
