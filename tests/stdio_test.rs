//! Stdio transport integration tests
//!
//! Drives `McpClient` over `StdioTransport` against the `mcp_test_server`
//! helper binary, which Cargo builds and exposes through
//! `CARGO_BIN_EXE_mcp_test_server`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use mcplink::client::{ClientHandlers, ClientState, McpClient, McpClientConfig, ServerCapabilityFlag};
use mcplink::error::McpError;
use mcplink::session::McpSession;
use mcplink::transport::stdio::{StdioServerParameters, StdioTransport};
use mcplink::transport::{Transport, TransportState};
use mcplink::types::{CallToolParams, LoggingLevel, Root};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn server_params(args: &[&str]) -> StdioServerParameters {
    StdioServerParameters::new(env!("CARGO_BIN_EXE_mcp_test_server")).args(args.iter().copied())
}

async fn connect(
    params: StdioServerParameters,
    config: McpClientConfig,
    handlers: ClientHandlers,
) -> (McpClient, Arc<StdioTransport>) {
    let transport = Arc::new(StdioTransport::new(params));
    let client = McpClient::connect(transport.clone(), config, handlers)
        .await
        .expect("failed to start mcp_test_server");
    (client, transport)
}

#[tokio::test]
async fn test_stdio_full_lifecycle() {
    let (client, transport) = connect(
        server_params(&[]),
        McpClientConfig::default(),
        ClientHandlers::default(),
    )
    .await;
    assert_eq!(transport.state(), TransportState::Connected);

    let init = tokio::time::timeout(TEST_TIMEOUT, client.initialize())
        .await
        .expect("initialize timed out")
        .expect("initialize failed");
    assert_eq!(init.server_info.name, "mcp-test-server");
    assert_eq!(init.instructions.as_deref(), Some("Test server for mcplink"));
    assert!(client.capable(ServerCapabilityFlag::Tools));
    assert!(client.capable(ServerCapabilityFlag::Logging));
    assert!(!client.capable(ServerCapabilityFlag::Experimental));

    let names: Vec<String> = client
        .list_all_tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["echo", "add"]);

    let echoed = client
        .execute_tool(
            CallToolParams::new("echo").with_arguments(serde_json::json!({"message": "hi"})),
        )
        .await
        .unwrap();
    assert_eq!(echoed.text(), "hi");
    assert_eq!(echoed.is_error, Some(false));

    let sum = client
        .execute_tool(CallToolParams::new("add").with_arguments(serde_json::json!({"a": 2, "b": 3})))
        .await
        .unwrap();
    assert_eq!(sum.text(), "5");

    client.check_health().await.unwrap();

    client.close_gracefully().await.unwrap();
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test]
async fn test_stdio_server_error_is_rpc_error() {
    let (client, _transport) = connect(
        server_params(&[]),
        McpClientConfig::default(),
        ClientHandlers::default(),
    )
    .await;
    client.initialize().await.unwrap();

    let err = client
        .execute_tool(CallToolParams::new("no_such_tool"))
        .await
        .unwrap_err();
    let mcp = err.downcast_ref::<McpError>().expect("typed error");
    assert_eq!(mcp.rpc_code(), Some(-32602));

    let failed = client
        .execute_tool(CallToolParams::new("fail"))
        .await
        .unwrap();
    assert_eq!(failed.is_error, Some(true));
    assert_eq!(failed.text(), "tool failed on purpose");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stdio_malformed_first_line_is_skipped() {
    // The garbage line arrives while `initialize` is still pending.
    let (client, _transport) = connect(
        server_params(&["--malformed-first"]),
        McpClientConfig::default(),
        ClientHandlers::default(),
    )
    .await;

    let init = tokio::time::timeout(TEST_TIMEOUT, client.initialize())
        .await
        .expect("initialize timed out")
        .unwrap();
    assert_eq!(init.protocol_version, "2025-03-26");
    client.ping().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stdio_unsupported_protocol_version() {
    let (client, _transport) = connect(
        server_params(&["--protocol-version", "1999-01-01"]),
        McpClientConfig::default(),
        ClientHandlers::default(),
    )
    .await;

    let err = client.initialize().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McpError>(),
        Some(McpError::ProtocolVersion { got, .. }) if got == "1999-01-01"
    ));
    assert_eq!(client.state(), ClientState::Failed);
    assert!(client.server_info().is_none());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stdio_older_supported_version_accepted() {
    let (client, _transport) = connect(
        server_params(&["--protocol-version", "2024-11-05"]),
        McpClientConfig::default(),
        ClientHandlers::default(),
    )
    .await;
    let init = client.initialize().await.unwrap();
    assert_eq!(init.protocol_version, "2024-11-05");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stdio_notifications_reach_handlers() {
    let (tools_tx, mut tools_rx) = mpsc::unbounded_channel();
    let (log_tx, mut log_rx) = mpsc::unbounded_channel();
    let handlers = ClientHandlers::default()
        .on_tools_changed(move |tools| {
            let _ = tools_tx.send(tools.len());
            Ok(())
        })
        .on_log_message(move |record| {
            let _ = log_tx.send(record);
            Ok(())
        });

    let (client, _transport) =
        connect(server_params(&[]), McpClientConfig::default(), handlers).await;
    client.initialize().await.unwrap();

    let reply = client
        .execute_tool(CallToolParams::new("notify"))
        .await
        .unwrap();
    assert_eq!(reply.text(), "notified");

    let count = tokio::time::timeout(TEST_TIMEOUT, tools_rx.recv())
        .await
        .expect("tools consumer not called")
        .unwrap();
    assert_eq!(count, 2);

    let record = tokio::time::timeout(TEST_TIMEOUT, log_rx.recv())
        .await
        .expect("log handler not called")
        .unwrap();
    assert_eq!(record.level, LoggingLevel::Warning);
    assert_eq!(record.logger.as_deref(), Some("test"));
    assert_eq!(record.data, serde_json::json!("heads up"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stdio_server_can_ask_for_roots() {
    let config = McpClientConfig {
        roots: vec![Root {
            uri: "file:///workspace".to_string(),
            name: Some("workspace".to_string()),
        }],
        ..McpClientConfig::default()
    };
    let (client, _transport) = connect(server_params(&[]), config, ClientHandlers::default()).await;
    client.initialize().await.unwrap();

    let reply = tokio::time::timeout(
        TEST_TIMEOUT,
        client.execute_tool(CallToolParams::new("roots")),
    )
    .await
    .expect("roots round trip timed out")
    .unwrap();
    let roots: serde_json::Value = serde_json::from_str(&reply.text()).unwrap();
    assert_eq!(roots["roots"][0]["uri"], "file:///workspace");
    assert_eq!(roots["roots"][0]["name"], "workspace");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stdio_resources_and_prompts() {
    let (client, _transport) = connect(
        server_params(&[]),
        McpClientConfig::default(),
        ClientHandlers::default(),
    )
    .await;
    client.initialize().await.unwrap();

    let resources = client.list_all_resources().await.unwrap();
    assert_eq!(resources[0].uri, "test://readme");

    let read = client.read_resource("test://readme").await.unwrap();
    match &read.contents[0] {
        mcplink::types::ResourceContents::Text(t) => {
            assert_eq!(t.text, "hello from the test server")
        }
        other => panic!("expected text contents, got {:?}", other),
    }

    let templates = client.list_all_resource_templates().await.unwrap();
    assert_eq!(templates[0].uri_template, "test://files/{name}");

    let prompts = client.list_all_prompts().await.unwrap();
    assert_eq!(prompts[0].name, "greet");

    let mut args = std::collections::HashMap::new();
    args.insert("who".to_string(), "Ferris".to_string());
    let prompt = client.get_prompt("greet", Some(args)).await.unwrap();
    assert_eq!(prompt.messages.len(), 1);
    assert_eq!(
        prompt.messages[0].content,
        mcplink::types::MessageContent::Text {
            text: "Say hello to Ferris".to_string()
        }
    );

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stdio_env_and_stderr_diagnostics() {
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&lines);
    let transport = Arc::new(
        StdioTransport::new(server_params(&[]).env("MCP_TEST_VAR", "from-parent")).with_diagnostic_handler(
            Arc::new(move |line| {
                if let Ok(mut lines) = sink.lock() {
                    lines.push(line);
                }
            }),
        ),
    );
    let client = McpClient::connect(
        transport.clone(),
        McpClientConfig::default(),
        ClientHandlers::default(),
    )
    .await
    .unwrap();
    client.initialize().await.unwrap();

    let reply = client
        .execute_tool(CallToolParams::new("env"))
        .await
        .unwrap();
    assert_eq!(reply.text(), "from-parent");

    client.close().await.unwrap();
    let lines = lines.lock().unwrap();
    assert!(
        lines.iter().any(|l| l.contains("mcp_test_server: ready")),
        "stderr lines: {:?}",
        *lines
    );
}

#[tokio::test]
async fn test_stdio_spawn_failure_is_transport_error() {
    let transport = Arc::new(StdioTransport::new(StdioServerParameters::new(
        "/definitely/not/a/real/mcp-server",
    )));
    let err = McpClient::connect(
        transport.clone(),
        McpClientConfig::default(),
        ClientHandlers::default(),
    )
    .await
    .unwrap_err();
    assert!(err
        .downcast_ref::<McpError>()
        .map(McpError::is_transport)
        .unwrap_or(false));
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test]
async fn test_session_close_does_not_wait_for_stubborn_child() {
    let params = StdioServerParameters::new("sh")
        .args(["-c", "trap '' TERM; while true; do sleep 0.1; done"])
        .inherit_env(true);
    let transport = Arc::new(StdioTransport::new(params).with_close_timeout(Duration::from_secs(10)));
    let session = McpSession::builder(transport.clone())
        .connect()
        .await
        .expect("failed to start sh");

    let started = std::time::Instant::now();
    session.close().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(2), "close took {:?}", elapsed);
    assert!(session.is_closed());
    assert_eq!(transport.state(), TransportState::Closed);
}
