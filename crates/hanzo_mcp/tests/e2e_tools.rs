//! End-to-end tests for the MCP tool pipeline.
//!
//! These exercise the full dispatcher with REAL files and REAL child
//! processes - no mocks. Each scenario drives the server the way a client
//! would: initialize, then tools/list and tools/call frames.

#![cfg(unix)]

use hanzo_mcp::{
    Dispatcher, JsonRpcRequest, JsonRpcResponse, McpServer, PathRule, RequestId, ServerConfig,
};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// HARNESS
// =============================================================================

struct Harness {
    dispatcher: Dispatcher,
    _state: TempDir,
}

async fn server(allow: &Path, tweak: impl FnOnce(&mut ServerConfig)) -> Harness {
    let state = TempDir::new().unwrap();
    let mut config = ServerConfig {
        state_root: state.path().to_path_buf(),
        path_rules: vec![PathRule::allow(allow.to_path_buf())],
        trusted_exec: true,
        ..Default::default()
    };
    tweak(&mut config);

    let server = McpServer::new(config).expect("server assembles");
    let dispatcher = server.dispatcher();

    let init = request(0, "initialize", json!({ "protocolVersion": "2024-11-05" }));
    dispatcher.dispatch(init).await.expect("initialize replies");

    Harness {
        dispatcher,
        _state: state,
    }
}

fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".into(),
        id: Some(RequestId::Number(id)),
        method: method.into(),
        params: Some(params),
    }
}

async fn call(harness: &Harness, id: i64, name: &str, arguments: Value) -> JsonRpcResponse {
    call_with_cursor(harness, id, name, arguments, None).await
}

async fn call_with_cursor(
    harness: &Harness,
    id: i64,
    name: &str,
    arguments: Value,
    cursor: Option<String>,
) -> JsonRpcResponse {
    let mut params = json!({ "name": name, "arguments": arguments });
    if let Some(cursor) = cursor {
        params["cursor"] = json!(cursor);
    }
    harness
        .dispatcher
        .dispatch(request(id, "tools/call", params))
        .await
        .expect("tools/call replies")
}

fn result(response: &JsonRpcResponse) -> &Value {
    assert!(
        response.error.is_none(),
        "unexpected error: {:?}",
        response.error
    );
    response.result.as_ref().expect("result present")
}

fn text_content(response: &JsonRpcResponse) -> String {
    result(response)["content"]
        .as_array()
        .expect("content array")
        .iter()
        .filter_map(|c| c["text"].as_str())
        .collect()
}

fn next_cursor(response: &JsonRpcResponse) -> Option<String> {
    result(response)["nextCursor"]
        .as_str()
        .or_else(|| result(response)["next_cursor"].as_str())
        .map(str::to_string)
}

fn list_items(response: &JsonRpcResponse) -> Vec<Value> {
    result(response)["content"][0]["data"]["items"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

fn error_kind(response: &JsonRpcResponse) -> String {
    response
        .error
        .as_ref()
        .expect("error present")
        .data
        .as_ref()
        .and_then(|d| d["kind"].as_str())
        .unwrap_or_default()
        .to_string()
}

// =============================================================================
// SCENARIO 1: LIST THEN CALL
// =============================================================================

#[tokio::test]
async fn list_then_read_file() {
    let work = TempDir::new().unwrap();
    std::fs::write(work.path().join("a.txt"), "hello\n").unwrap();
    let harness = server(work.path(), |_| {}).await;

    let listing = harness
        .dispatcher
        .dispatch(request(1, "tools/list", json!({})))
        .await
        .unwrap();
    let tools = result(&listing)["tools"].as_array().unwrap().clone();
    assert!(tools.iter().any(|t| t["name"] == "read_file"));
    for tool in &tools {
        assert!(tool["inputSchema"]["type"] == "object");
        assert!(!tool["description"].as_str().unwrap().is_empty());
    }

    let response = call(
        &harness,
        2,
        "read_file",
        json!({ "path": work.path().join("a.txt").display().to_string() }),
    )
    .await;

    assert_eq!(text_content(&response), "1: hello\n");
    assert!(next_cursor(&response).is_none());
}

// =============================================================================
// SCENARIO 2: PERMISSION DENIED
// =============================================================================

#[tokio::test]
async fn read_outside_allowlist_names_the_path() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;

    let response = call(&harness, 1, "read_file", json!({ "path": "/etc/passwd" })).await;

    let error = response.error.as_ref().expect("permission error");
    assert_eq!(error.code, -32002);
    assert!(error.message.contains("/etc/passwd"));
    assert_eq!(error_kind(&response), "permission_denied");
}

// =============================================================================
// SCENARIO 3: AUTO-BACKGROUND
// =============================================================================

#[tokio::test]
async fn long_shell_backgrounds_and_logs_catch_up() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |config| {
        config.auto_background = Duration::from_secs(1);
    })
    .await;

    let started = std::time::Instant::now();
    let response = call(
        &harness,
        1,
        "shell",
        json!({
            "command": "sleep 2 && echo done",
            "cwd": work.path().display().to_string()
        }),
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(2), "reply within ≈1s");

    let text = text_content(&response);
    assert!(text.contains("backgrounded as "), "got: {}", text);
    let session_id = text.trim().rsplit(' ').next().unwrap().to_string();
    assert!(session_id.starts_with("proc_"));
    assert!(next_cursor(&response).is_some(), "log cursor expected");

    // poll logs until the child finishes and its output lands
    let mut found = false;
    for attempt in 0..50 {
        let logs = call(
            &harness,
            10 + attempt,
            "process_logs",
            json!({ "session_id": session_id }),
        )
        .await;
        if text_content(&logs).contains("done") {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(found, "backgrounded output never surfaced");

    let listing = call(&harness, 99, "process_list", json!({})).await;
    let sessions = list_items(&listing);
    let session = sessions
        .iter()
        .find(|s| s["session_id"] == json!(session_id))
        .expect("session listed");
    assert_eq!(session["state"], "exited");
    assert_eq!(session["exit_status"], 0);
}

#[tokio::test]
async fn fast_shell_exits_in_foreground() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |config| {
        config.auto_background = Duration::from_secs(5);
    })
    .await;

    let response = call(
        &harness,
        1,
        "shell",
        json!({
            "command": "echo quick",
            "cwd": work.path().display().to_string()
        }),
    )
    .await;

    let text = text_content(&response);
    assert!(text.contains("quick"));
    assert!(!text.contains("backgrounded"));

    let header = &result(&response)["content"][0]["data"];
    assert_eq!(header["state"], "exited");
    assert_eq!(header["exit_status"], 0);
}

// =============================================================================
// SCENARIO 4: DAG FAILURE CASCADES
// =============================================================================

#[tokio::test]
async fn dag_failure_cascades_to_dependents() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;

    let response = call(
        &harness,
        1,
        "dag_shell",
        json!({
            "cwd": work.path().display().to_string(),
            "steps": [
                {"id": "a", "run": "true"},
                {"id": "b", "run": "false", "after": ["a"]},
                {"id": "c", "run": "echo skip", "after": ["b"]},
            ]
        }),
    )
    .await;

    let items = list_items(&response);
    let summary = &items[0];
    assert_eq!(summary["success"], false);
    assert_eq!(summary["failed_step"], "b");

    let step = |id: &str| {
        items[1..]
            .iter()
            .find(|s| s["id"] == json!(id))
            .unwrap_or_else(|| panic!("step {} in transcript", id))
            .clone()
    };
    assert_eq!(step("a")["status"], "success");
    assert_eq!(step("b")["status"], "failed");
    assert_eq!(step("b")["exit_status"], 1);
    assert_eq!(step("c")["status"], "skipped");
}

#[tokio::test]
async fn dag_cycle_is_invalid_arguments() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;

    let response = call(
        &harness,
        1,
        "dag_shell",
        json!({
            "cwd": work.path().display().to_string(),
            "steps": [
                {"id": "a", "run": "true", "after": ["b"]},
                {"id": "b", "run": "true", "after": ["a"]},
            ]
        }),
    )
    .await;

    assert_eq!(error_kind(&response), "invalid_arguments");
    assert!(response.error.unwrap().message.contains("cycle"));
}

// =============================================================================
// SCENARIO 5: TOKEN-CAP PAGINATION
// =============================================================================

#[tokio::test]
async fn paginated_search_walks_all_hits_without_gaps() {
    let work = TempDir::new().unwrap();
    let mut body = String::new();
    for i in 0..1000 {
        body.push_str(&format!("hit number {:04}\n", i));
    }
    std::fs::write(work.path().join("big.txt"), &body).unwrap();

    // ground truth from an unpaginated call under a cap wide enough for
    // every hit at once
    let wide = server(work.path(), |config| {
        config.response_token_cap = 200_000;
    })
    .await;
    let ground = call(
        &wide,
        1,
        "search",
        json!({ "pattern": "hit", "path": work.path().display().to_string() }),
    )
    .await;
    let ground_items = list_items(&ground);
    assert_eq!(ground_items.len(), 1000);
    assert!(next_cursor(&ground).is_none());

    // a tight cap forces pagination
    let narrow = server(work.path(), |config| {
        config.response_token_cap = 2000;
    })
    .await;

    let mut collected: Vec<Value> = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;
    loop {
        let response = call_with_cursor(
            &narrow,
            100 + pages,
            "search",
            json!({ "pattern": "hit", "path": work.path().display().to_string() }),
            cursor.clone(),
        )
        .await;
        let items = list_items(&response);
        assert!(!items.is_empty(), "every page makes progress");
        collected.extend(items);
        pages += 1;
        assert!(pages < 500, "pagination must terminate");
        match next_cursor(&response) {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    assert!(pages > 1, "tight cap should need several pages");
    assert_eq!(collected.len(), ground_items.len(), "no gaps, no duplicates");
    assert_eq!(collected, ground_items, "same sequence as unpaginated call");
}

#[tokio::test]
async fn truncated_file_read_continues_to_completion() {
    let work = TempDir::new().unwrap();
    let mut body = String::new();
    for i in 0..400 {
        body.push_str(&format!("line {} of the fixture\n", i));
    }
    std::fs::write(work.path().join("long.txt"), &body).unwrap();
    let path = work.path().join("long.txt").display().to_string();

    let wide = server(work.path(), |config| {
        config.response_token_cap = 200_000;
    })
    .await;
    let full = text_content(&call(&wide, 1, "read_file", json!({ "path": &path })).await);

    let narrow = server(work.path(), |config| {
        config.response_token_cap = 1500;
    })
    .await;

    let mut assembled = String::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;
    loop {
        let response =
            call_with_cursor(&narrow, 10 + pages, "read_file", json!({ "path": &path }), cursor)
                .await;
        let text = text_content(&response);
        // strip the visible truncation marker before reassembly
        let clean = match text.find("\n[output truncated:") {
            Some(cut) => &text[..cut],
            None => &text[..],
        };
        assembled.push_str(clean);
        pages += 1;
        assert!(pages < 200, "pagination must terminate");
        match next_cursor(&response) {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    assert!(pages > 1, "tight cap should truncate the first page");
    assert_eq!(assembled, full, "reassembly matches the unbounded read");
}

#[tokio::test]
async fn deadline_expiry_cancels_the_invocation() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |config| {
        config.auto_background = Duration::ZERO; // foreground forever
        config.kill_grace = Duration::from_millis(300);
    })
    .await;

    let started = std::time::Instant::now();
    let response = harness
        .dispatcher
        .dispatch(request(
            1,
            "tools/call",
            json!({
                "name": "shell",
                "arguments": { "command": "sleep 60", "cwd": work.path().display().to_string() },
                "deadline_ms": 300,
            }),
        ))
        .await
        .unwrap();

    assert_eq!(error_kind(&response), "cancelled");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn stale_and_mismatched_cursors_fail_cleanly() {
    let work = TempDir::new().unwrap();
    let mut body = String::new();
    for i in 0..500 {
        body.push_str(&format!("needle {:03}\n", i));
    }
    std::fs::write(work.path().join("big.txt"), &body).unwrap();

    let harness = server(work.path(), |config| {
        config.response_token_cap = 2000;
    })
    .await;

    let first = call(
        &harness,
        1,
        "search",
        json!({ "pattern": "needle", "path": work.path().display().to_string() }),
    )
    .await;
    let cursor = next_cursor(&first).expect("tight cap yields a cursor");

    // different arguments: checksum mismatch, cursor survives
    let mismatch = call_with_cursor(
        &harness,
        2,
        "search",
        json!({ "pattern": "other", "path": work.path().display().to_string() }),
        Some(cursor.clone()),
    )
    .await;
    assert_eq!(error_kind(&mismatch), "cursor_mismatch");

    // original arguments: redeems fine...
    let second = call_with_cursor(
        &harness,
        3,
        "search",
        json!({ "pattern": "needle", "path": work.path().display().to_string() }),
        Some(cursor.clone()),
    )
    .await;
    assert!(second.error.is_none());

    // ...and the consumed id is stale from then on
    let stale = call_with_cursor(
        &harness,
        4,
        "search",
        json!({ "pattern": "needle", "path": work.path().display().to_string() }),
        Some(cursor),
    )
    .await;
    assert_eq!(error_kind(&stale), "not_found");
}

// =============================================================================
// SCENARIO 6: CANCELLATION
// =============================================================================

#[tokio::test]
async fn cancel_notification_stops_a_running_shell() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |config| {
        config.auto_background = Duration::ZERO; // foreground forever
        config.kill_grace = Duration::from_millis(300);
    })
    .await;

    let dispatcher = harness.dispatcher.clone();
    let cwd = work.path().display().to_string();
    let pending = tokio::spawn(async move {
        dispatcher
            .dispatch(request(
                7,
                "tools/call",
                json!({ "name": "shell", "arguments": { "command": "sleep 60", "cwd": cwd } }),
            ))
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancel = JsonRpcRequest {
        jsonrpc: "2.0".into(),
        id: None,
        method: "$/cancel".into(),
        params: Some(json!({ "id": 7 })),
    };
    assert!(harness.dispatcher.dispatch(cancel).await.is_none());

    let response = tokio::time::timeout(Duration::from_secs(10), pending)
        .await
        .expect("terminal response within the grace window")
        .unwrap()
        .expect("response for request 7");
    assert_eq!(error_kind(&response), "cancelled");

    // the child is gone shortly after
    tokio::time::sleep(Duration::from_millis(500)).await;
    let listing = call(&harness, 8, "process_list", json!({})).await;
    for session in list_items(&listing) {
        assert_ne!(session["state"], "running", "child still live: {:?}", session);
    }
}

// =============================================================================
// BOUNDARY BEHAVIOURS
// =============================================================================

#[tokio::test]
async fn empty_command_is_invalid_arguments() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;

    let response = call(
        &harness,
        1,
        "shell",
        json!({ "command": "   ", "cwd": work.path().display().to_string() }),
    )
    .await;
    assert_eq!(error_kind(&response), "invalid_arguments");
}

#[tokio::test]
async fn search_without_matches_is_an_empty_list() {
    let work = TempDir::new().unwrap();
    std::fs::write(work.path().join("a.txt"), "nothing here\n").unwrap();
    let harness = server(work.path(), |_| {}).await;

    let response = call(
        &harness,
        1,
        "search",
        json!({ "pattern": "zzz_absent", "path": work.path().display().to_string() }),
    )
    .await;

    assert!(response.error.is_none());
    assert!(list_items(&response).is_empty());
    assert!(next_cursor(&response).is_none());
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;

    let response = call(&harness, 1, "no_such_tool", json!({})).await;
    assert_eq!(error_kind(&response), "not_found");
}

#[tokio::test]
async fn schema_violation_names_the_field() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;

    let response = call(&harness, 1, "read_file", json!({ "path": 42 })).await;
    assert_eq!(error_kind(&response), "invalid_arguments");
    assert!(response.error.unwrap().message.contains("`path`"));
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;
    let target = work.path().join("out.txt").display().to_string();

    let write = call(
        &harness,
        1,
        "write_file",
        json!({ "path": target, "content": "alpha\nbeta\n" }),
    )
    .await;
    assert!(write.error.is_none());

    let read = call(&harness, 2, "read_file", json!({ "path": target })).await;
    assert_eq!(text_content(&read), "1: alpha\n2: beta\n");
}

#[tokio::test]
async fn disabled_write_tools_vanish_from_the_registry() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |config| {
        config.disable_write_tools = true;
    })
    .await;

    let listing = harness
        .dispatcher
        .dispatch(request(1, "tools/list", json!({})))
        .await
        .unwrap();
    let tools = result(&listing)["tools"].as_array().unwrap().clone();
    assert!(!tools.iter().any(|t| t["name"] == "write_file"));
    assert!(!tools.iter().any(|t| t["name"] == "edit_file"));
    assert!(tools.iter().any(|t| t["name"] == "read_file"));

    let response = call(
        &harness,
        2,
        "write_file",
        json!({ "path": work.path().join("x").display().to_string(), "content": "x" }),
    )
    .await;
    assert_eq!(error_kind(&response), "not_found");
}

// =============================================================================
// PROTOCOL PLUMBING
// =============================================================================

#[tokio::test]
async fn initialize_advertises_capabilities() {
    let work = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let config = ServerConfig {
        state_root: state.path().to_path_buf(),
        path_rules: vec![PathRule::allow(work.path().to_path_buf())],
        ..Default::default()
    };
    let server = McpServer::new(config).unwrap();
    let dispatcher = server.dispatcher();

    let response = dispatcher
        .dispatch(request(1, "initialize", json!({ "protocolVersion": "2024-11-05" })))
        .await
        .unwrap();

    let caps = &result(&response)["capabilities"];
    assert_eq!(caps["tools"], true);
    assert_eq!(caps["cursors"], true);
    assert_eq!(caps["cancellation"], true);
    assert_eq!(result(&response)["serverInfo"]["name"], "hanzo-mcp");
}

#[tokio::test]
async fn tools_call_before_initialize_is_rejected() {
    let work = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let config = ServerConfig {
        state_root: state.path().to_path_buf(),
        path_rules: vec![PathRule::allow(work.path().to_path_buf())],
        ..Default::default()
    };
    let server = McpServer::new(config).unwrap();

    let response = server
        .dispatcher()
        .dispatch(request(
            1,
            "tools/call",
            json!({ "name": "read_file", "arguments": { "path": "/x" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32000);
}

#[tokio::test]
async fn malformed_frame_with_id_gets_a_protocol_error() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;

    let response = harness
        .dispatcher
        .handle_raw(r#"{"id": 5, "method": "tools/call", "params": "#)
        .await;
    assert!(response.is_none(), "unparseable JSON has no recoverable id");

    let response = harness
        .dispatcher
        .handle_raw(r#"{"id": 5, "jsonrpc": "2.0"}"#)
        .await
        .expect("id recoverable");
    assert_eq!(response.id, Some(RequestId::Number(5)));
    assert!(response.error.is_some());
}

#[tokio::test]
async fn ping_and_unknown_methods() {
    let work = TempDir::new().unwrap();
    let harness = server(work.path(), |_| {}).await;

    let pong = harness
        .dispatcher
        .dispatch(request(1, "ping", json!({})))
        .await
        .unwrap();
    assert!(pong.error.is_none());

    let unknown = harness
        .dispatcher
        .dispatch(request(2, "bogus/method", json!({})))
        .await
        .unwrap();
    assert_eq!(unknown.error.unwrap().code, -32601);
}

#[tokio::test]
async fn every_request_gets_exactly_one_response_with_its_id() {
    let work = TempDir::new().unwrap();
    std::fs::write(work.path().join("a.txt"), "data\n").unwrap();
    let harness = server(work.path(), |_| {}).await;

    let mut handles = Vec::new();
    for id in 0..32i64 {
        let dispatcher = harness.dispatcher.clone();
        let path = work.path().join("a.txt").display().to_string();
        handles.push(tokio::spawn(async move {
            dispatcher
                .dispatch(request(id, "tools/call", json!({
                    "name": "read_file",
                    "arguments": { "path": path }
                })))
                .await
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for (id, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap().expect("one terminal response");
        assert_eq!(response.id, Some(RequestId::Number(id as i64)));
        assert!(seen.insert(id), "duplicate response id");
    }
    assert_eq!(seen.len(), 32);
}

// =============================================================================
// SESSION LOG
// =============================================================================

#[tokio::test]
async fn session_log_records_summaries_not_bodies() {
    let work = TempDir::new().unwrap();
    std::fs::write(work.path().join("secret.txt"), "hunter2\n").unwrap();

    let state = TempDir::new().unwrap();
    let config = ServerConfig {
        state_root: state.path().to_path_buf(),
        path_rules: vec![PathRule::allow(work.path().to_path_buf())],
        ..Default::default()
    };
    let server = McpServer::new(config).unwrap();
    let dispatcher = server.dispatcher();
    dispatcher
        .dispatch(request(0, "initialize", json!({})))
        .await
        .unwrap();
    dispatcher
        .dispatch(request(
            1,
            "tools/call",
            json!({ "name": "read_file", "arguments": {
                "path": work.path().join("secret.txt").display().to_string()
            }}),
        ))
        .await
        .unwrap();

    let log_path = state
        .path()
        .join("sessions")
        .join(format!("{}.jsonl", std::process::id()));
    let content = std::fs::read_to_string(&log_path).expect("session log written");
    assert!(content.contains("read_file"));
    assert!(content.contains("argument_digest"));
    // neither the file content nor its path may leak into the log
    assert!(!content.contains("hunter2"));
    assert!(!content.contains("secret.txt"));
}
