//! MCP test server binary for integration tests
//!
//! A minimal MCP server speaking newline-delimited JSON-RPC over
//! stdin/stdout. Integration tests spawn it through [`StdioTransport`] to
//! exercise the full stdio pipeline without a real MCP server.
//!
//! # Flags
//!
//! - `--malformed-first` writes a line of garbage just before the first
//!   response, while the client's request is still pending.
//! - `--protocol-version <v>` answers `initialize` with `v`
//!   (default `2025-03-26`).
//!
//! # Handled Methods
//!
//! - `initialize`: advertises `tools` (with `listChanged`), `resources`,
//!   `prompts` and `logging`.
//! - `ping`: empty result.
//! - `tools/list`: two pages, `echo` then `add`.
//! - `tools/call`:
//!   - `echo` returns `arguments.message`.
//!   - `add` returns `a + b`.
//!   - `fail` returns an `isError` result.
//!   - `env` returns `$MCP_TEST_VAR`.
//!   - `notify` first emits `notifications/tools/list_changed` and a
//!     `notifications/message` record.
//!   - `roots` asks the client for `roots/list` and returns the answer
//!     as text.
//! - `resources/list`, `resources/read`, `resources/templates/list`,
//!   `prompts/list`, `prompts/get`: small fixed data sets.
//! - Anything else: `-32601 Method not found`.
//!
//! The server writes `mcp_test_server: ready` to stderr on startup.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

const ROOTS_REQUEST_ID: &str = "server-roots-1";

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut malformed_pending = args.iter().any(|a| a == "--malformed-first");
    let protocol_version = args
        .iter()
        .position(|a| a == "--protocol-version")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "2025-03-26".to_string());

    eprintln!("mcp_test_server: ready");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    // id of a `tools/call roots` waiting for the client's roots/list answer
    let mut waiting_for_roots: Option<Value> = None;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                let response = make_error(&Value::Null, -32700, "Parse error");
                if !send(&mut out, &response) {
                    break;
                }
                continue;
            }
        };

        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let method = message.get("method").and_then(|m| m.as_str());

        let Some(method) = method else {
            // A response from the client.
            if id == json!(ROOTS_REQUEST_ID) {
                if let Some(call_id) = waiting_for_roots.take() {
                    let roots = message.get("result").cloned().unwrap_or(Value::Null);
                    let reply = text_result(&call_id, &roots.to_string(), false);
                    if !send(&mut out, &reply) {
                        break;
                    }
                }
            }
            continue;
        };

        if id.is_null() {
            // Notifications need no answer.
            continue;
        }

        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let response = match method {
            "initialize" => handle_initialize(&id, &protocol_version),
            "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            "tools/list" => handle_tools_list(&id, &params),
            "tools/call" => {
                let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
                match name {
                    "notify" => {
                        let changed = json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/tools/list_changed"
                        });
                        let log = json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/message",
                            "params": {"level": "warning", "logger": "test", "data": "heads up"}
                        });
                        if !send(&mut out, &changed) || !send(&mut out, &log) {
                            break;
                        }
                        text_result(&id, "notified", false)
                    }
                    "roots" => {
                        let request = json!({
                            "jsonrpc": "2.0",
                            "id": ROOTS_REQUEST_ID,
                            "method": "roots/list"
                        });
                        waiting_for_roots = Some(id.clone());
                        if !send(&mut out, &request) {
                            break;
                        }
                        continue;
                    }
                    _ => handle_tools_call(&id, name, &params),
                }
            }
            "resources/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "resources": [
                        {"uri": "test://readme", "name": "readme", "mimeType": "text/plain"}
                    ]
                }
            }),
            "resources/read" => {
                let uri = params.get("uri").and_then(|u| u.as_str()).unwrap_or("");
                if uri == "test://readme" {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "contents": [
                                {"uri": uri, "mimeType": "text/plain", "text": "hello from the test server"}
                            ]
                        }
                    })
                } else {
                    make_error(&id, -32602, &format!("Unknown resource: {}", uri))
                }
            }
            "resources/templates/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "resourceTemplates": [
                        {"uriTemplate": "test://files/{name}", "name": "files"}
                    ]
                }
            }),
            "prompts/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "prompts": [
                        {
                            "name": "greet",
                            "description": "Greets someone",
                            "arguments": [{"name": "who", "required": true}]
                        }
                    ]
                }
            }),
            "prompts/get" => {
                let who = params
                    .get("arguments")
                    .and_then(|a| a.get("who"))
                    .and_then(|w| w.as_str())
                    .unwrap_or("world");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "description": "A greeting",
                        "messages": [
                            {"role": "user", "content": {"type": "text", "text": format!("Say hello to {}", who)}}
                        ]
                    }
                })
            }
            other => make_error(&id, -32601, &format!("Method not found: {}", other)),
        };

        if std::mem::take(&mut malformed_pending) {
            let _ = writeln!(out, "this is not json {{");
            let _ = out.flush();
        }
        if !send(&mut out, &response) {
            break;
        }
    }
}

/// Write one message as a line. Returns `false` when stdout is gone.
fn send(out: &mut impl Write, message: &Value) -> bool {
    let serialized = match serde_json::to_string(message) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("mcp_test_server: failed to serialize message: {}", e);
            return true;
        }
    };
    writeln!(out, "{}", serialized).is_ok() && out.flush().is_ok()
}

fn handle_initialize(id: &Value, protocol_version: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": {"listChanged": true},
                "resources": {},
                "prompts": {},
                "logging": {}
            },
            "serverInfo": {
                "name": "mcp-test-server",
                "version": "0.1.0"
            },
            "instructions": "Test server for mcplink"
        }
    })
}

/// Two pages: the first carries `echo` and a cursor, the second `add`.
fn handle_tools_list(id: &Value, params: &Value) -> Value {
    let cursor = params.get("cursor").and_then(|c| c.as_str());
    let result = match cursor {
        None => json!({
            "tools": [{
                "name": "echo",
                "description": "Echoes input",
                "inputSchema": {
                    "type": "object",
                    "properties": {"message": {"type": "string"}}
                }
            }],
            "nextCursor": "page-2"
        }),
        Some(_) => json!({
            "tools": [{
                "name": "add",
                "description": "Adds two numbers",
                "inputSchema": {
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"]
                }
            }]
        }),
    };
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn handle_tools_call(id: &Value, name: &str, params: &Value) -> Value {
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    match name {
        "echo" => {
            let message = arguments
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("");
            text_result(id, message, false)
        }
        "add" => {
            let a = arguments.get("a").and_then(|v| v.as_f64());
            let b = arguments.get("b").and_then(|v| v.as_f64());
            match (a, b) {
                (Some(a), Some(b)) => text_result(id, &(a + b).to_string(), false),
                _ => make_error(id, -32602, "add requires numeric a and b"),
            }
        }
        "fail" => text_result(id, "tool failed on purpose", true),
        "env" => {
            let value = std::env::var("MCP_TEST_VAR").unwrap_or_else(|_| "<unset>".to_string());
            text_result(id, &value, false)
        }
        other => make_error(id, -32602, &format!("Unknown tool: {}", other)),
    }
}

fn text_result(id: &Value, text: &str, is_error: bool) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [{"type": "text", "text": text}],
            "isError": is_error
        }
    })
}

fn make_error(id: &Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    })
}
