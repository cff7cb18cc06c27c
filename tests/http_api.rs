//! End-to-end checks against live servers over real sockets.

use std::time::Duration;

use localwrap_core::config::GlobalConfig;
use localwrap_core::ipc::AppState;
use serde_json::{json, Value};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn live_state() -> (AppState, u16) {
    let port = free_port();
    let apps_dir = std::env::temp_dir().join("localwrap-http-tests");
    let state = AppState::new(GlobalConfig {
        default_port: port,
        apps_dir,
        restart_delay_ms: 50,
        kill_grace_ms: 1000,
        // Polling loops below go well past the default budget
        rate_limit_max: 10_000,
        ..GlobalConfig::default()
    });
    state.start_server(port).await.unwrap();
    (state, port)
}

fn api(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", port, path)
}

#[tokio::test]
async fn test_live_status_and_headers() {
    let (state, port) = live_state().await;

    let resp = reqwest::get(api(port, "/api/status")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("referrer-policy").unwrap(),
        "strict-origin-when-cross-origin"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["port"], port);
    assert_eq!(body["status"], "running");

    state.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_shared_across_ports() {
    let port = free_port();
    let other = free_port();
    let state = AppState::new(GlobalConfig {
        default_port: port,
        rate_limit_max: 3,
        ..GlobalConfig::default()
    });
    state.start_server(port).await.unwrap();
    state.start_server(other).await.unwrap();

    for p in [port, port, other] {
        let resp = reqwest::get(api(p, "/api/status")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = reqwest::get(api(other, "/api/status")).await.unwrap();
    assert_eq!(resp.status(), 429);
    assert!(resp.headers().contains_key("retry-after"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["errorCode"], "RATE_LIMITED");

    state.shutdown().await;
}

#[tokio::test]
async fn test_manage_second_server_over_http() {
    let (state, port) = live_state().await;
    let client = reqwest::Client::new();
    let other = free_port();

    let resp = client
        .post(api(port, &format!("/api/servers/{}/start", other)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["server"]["status"], "running");

    // Same route set is served on the new port
    let body: Value = reqwest::get(api(other, "/api/status")).await.unwrap().json().await.unwrap();
    assert_eq!(body["port"], other);

    let again = client
        .post(api(port, &format!("/api/servers/{}/start", other)))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 400);
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["error"], format!("Server already running on port {}", other));

    let list: Value = reqwest::get(api(port, "/api/servers")).await.unwrap().json().await.unwrap();
    assert_eq!(list["total"], 2);

    let resp = client
        .post(api(port, &format!("/api/servers/{}/restart", other)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(api(port, &format!("/api/servers/{}/stop", other)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let status: Value = reqwest::get(api(port, &format!("/api/servers/{}/status", other)))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status, json!({ "port": other, "status": "stopped" }));

    state.shutdown().await;
}

#[tokio::test]
async fn test_server_can_stop_itself() {
    let (state, port) = live_state().await;

    let resp = reqwest::Client::new()
        .post(api(port, &format!("/api/servers/{}/stop", port)))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(state.servers.count().await, 0);
    assert!(!state.servers.status(port).await.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn test_execute_poll_and_stop_over_http() {
    let (state, port) = live_state().await;
    let client = reqwest::Client::new();
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("serve.sh"), "echo \"listening on $PORT\"\nexec sleep 30\n").unwrap();

    let script_port = free_port();
    let body: Value = client
        .post(api(port, "/api/script/execute"))
        .json(&json!({
            "script": "sh serve.sh",
            "port": script_port.to_string(),
            "workingDir": dir.path(),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["effectivePort"], script_port);
    assert!(body["portMessage"].is_null());
    let pid = body["pid"].as_u64().unwrap();

    let listed: Value = reqwest::get(api(port, "/api/scripts")).await.unwrap().json().await.unwrap();
    assert_eq!(listed["total"], 1);

    // Full log does not consume, so the poll below still sees this line
    let mut ready = false;
    for _ in 0..100 {
        let log: Value = reqwest::get(api(port, &format!("/api/script/log/{}", pid)))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if !log["output"].as_array().unwrap().is_empty() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ready);

    let resp = client
        .post(api(port, &format!("/api/script/stop/{}", pid)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut collected: Vec<String> = Vec::new();
    for _ in 0..100 {
        let chunk: Value = reqwest::get(api(port, &format!("/api/script/output/{}", pid)))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(chunk["running"], false);
        for line in chunk["output"].as_array().unwrap() {
            collected.push(line.as_str().unwrap().to_string());
        }
        if collected.iter().any(|l| l.starts_with("Process exited")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(collected[0], format!("listening on {}", script_port));
    assert!(collected.contains(&"Process terminated by user".to_string()));
    assert!(collected.last().unwrap().starts_with("Process exited"));

    let full: Value = reqwest::get(api(port, &format!("/api/script/log/{}", pid)))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(full["output"].as_array().unwrap().len(), collected.len());

    state.shutdown().await;
}

#[tokio::test]
async fn test_python_http_server_round_trip() {
    let has_python = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !has_python {
        eprintln!("python3 not available, skipping");
        return;
    }

    let (state, port) = live_state().await;
    let client = reqwest::Client::new();
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.html"), "hello from localwrap").unwrap();

    let script_port = free_port();
    let body: Value = client
        .post(api(port, "/api/script/execute"))
        .json(&json!({
            "script": format!("python3 -m http.server {}", script_port),
            "port": script_port,
            "workingDir": dir.path(),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let pid = body["pid"].as_u64().unwrap();

    let mut served = None;
    for _ in 0..100 {
        if let Ok(resp) = reqwest::get(format!("http://127.0.0.1:{}/index.html", script_port)).await {
            served = resp.text().await.ok();
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(served.as_deref(), Some("hello from localwrap"));

    client
        .post(api(port, &format!("/api/script/stop/{}", pid)))
        .send()
        .await
        .unwrap();

    let mut exited = false;
    for _ in 0..100 {
        let log: Value = reqwest::get(api(port, &format!("/api/script/log/{}", pid)))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let lines = log["output"].as_array().unwrap();
        if lines.iter().any(|l| l.as_str().unwrap_or("").starts_with("Process exited")) {
            exited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(exited);

    state.shutdown().await;
}
