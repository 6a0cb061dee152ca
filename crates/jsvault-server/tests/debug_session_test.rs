//! Debug Session Integration Tests
//!
//! Exercises debug sessions end to end through a [`ScriptHost`]: the
//! session handler, the shared worker pool, the streaming console and the
//! registry's reclamation of timed-out tasks.

use jsvault_common::protocol::JOIN_TYPE;
use jsvault_server::folder::MemoryFileStore;
use jsvault_server::task::registry::TIMEOUT_MESSAGE;
use jsvault_server::task::{Connection, Outbound, PoolConfig};
use jsvault_server::{Backend, ScriptHost, ServerConfig};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn host(files: &[(&str, &str)]) -> ScriptHost {
    let store = Arc::new(MemoryFileStore::new());
    for (path, content) in files {
        store.put_file("biz", "dev", path, *content).unwrap();
    }
    let config = ServerConfig::new()
        .with_namespace("biz", "web")
        .with_pool(PoolConfig::new().with_max_workers(2).with_queue_capacity(4));
    ScriptHost::new(config, Backend::Store(store)).unwrap()
}

fn debug_message(path: &str, fn_name: &str) -> String {
    json!({
        "type": "debug",
        "bizType": "biz",
        "groupName": "dev",
        "fileFullPath": path,
        "fnName": fn_name
    })
    .to_string()
}

async fn next_frame(rx: &mut UnboundedReceiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("frame in time")
        .expect("channel open")
}

fn json_frame(frame: Outbound) -> JsonValue {
    match frame {
        Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
        Outbound::Close => panic!("unexpected close"),
    }
}

#[tokio::test]
async fn test_debug_session_uses_its_own_namespace_and_stops() {
    let host = host(&[(
        "/jobs/hello.js",
        "exports.run = function () { console.log('hello', { n: 1 }); console.error('done'); };",
    )]);
    let (conn, mut rx) = Connection::new();
    host.sessions().on_text(&conn, &debug_message("/jobs/hello.js", "run"));

    let first = json_frame(next_frame(&mut rx).await);
    assert_eq!(
        first,
        json!({
            "level": "log",
            "filePath": "/jobs/",
            "fileName": "hello.js",
            "message": "hello {\"n\":1}",
            "args": ["hello", {"n": 1}]
        })
    );
    assert_eq!(json_frame(next_frame(&mut rx).await)["level"], "error");
    assert_eq!(next_frame(&mut rx).await, Outbound::Close);

    // the production runtimes never saw the debug group's module
    for runtime in host.dispatcher().runtimes().runtimes() {
        assert!(runtime.cached_paths().unwrap().is_empty());
    }

    host.registry().sweep().await;
    assert!(host.registry().is_empty());
}

#[tokio::test]
async fn test_viewer_can_join_a_running_session() {
    let host = host(&[(
        "/slow.js",
        "exports.run = function () { utils.sleep(300); console.info('finished'); };",
    )]);
    let (owner, mut owner_rx) = Connection::new();
    host.sessions().on_text(&owner, &debug_message("/slow.js", "run"));
    let task_id = host.registry().snapshot().tasks[0].id.clone();

    let (viewer, mut viewer_rx) = Connection::new();
    host.sessions().on_text(
        &viewer,
        &json!({"type": JOIN_TYPE, "taskId": task_id}).to_string(),
    );
    assert_eq!(host.registry().snapshot().session_count, 2);

    for rx in [&mut owner_rx, &mut viewer_rx] {
        assert_eq!(json_frame(next_frame(rx).await)["message"], "finished");
        assert_eq!(next_frame(rx).await, Outbound::Close);
    }
}

#[tokio::test(start_paused = true)]
async fn test_runaway_debug_session_is_reclaimed_after_timeout() {
    let host = host(&[(
        "/stuck.js",
        "exports.run = function () { utils.sleep(1500); };",
    )]);
    host.start();
    let (conn, mut rx) = Connection::new();
    host.sessions().on_text(&conn, &debug_message("/stuck.js", "run"));
    assert_eq!(host.registry().len(), 1);

    // paused clock: the sweeper sees 5s pass while the script is still asleep
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(host.registry().is_empty());

    let timeout = json_frame(next_frame(&mut rx).await);
    assert_eq!(timeout, json!({"level": "error", "message": TIMEOUT_MESSAGE}));
    assert_eq!(next_frame(&mut rx).await, Outbound::Close);
    assert!(!conn.is_open());

    host.shutdown().await;
}
