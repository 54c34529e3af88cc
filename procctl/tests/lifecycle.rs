#![cfg(unix)]

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn spawn_procctl(port: u16, logs: &std::path::Path, script: &str) -> Child {
    Command::new(env!("CARGO_BIN_EXE_helm-procctl"))
        .arg("--port")
        .arg(port.to_string())
        .arg("--logs-dir")
        .arg(logs)
        .args(["--", "sh", "-c", script])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .spawn()
        .unwrap()
}

async fn wait_healthy(client: &reqwest::Client, port: u16) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(resp) = client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
        {
            return resp.json().await.unwrap();
        }
        assert!(Instant::now() < deadline, "control endpoint never came up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn wait_exit(child: &mut Child, within: Duration) -> std::process::ExitStatus {
    let deadline = Instant::now() + within;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("procctl did not exit");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[tokio::test]
async fn shutdown_force_kills_stubborn_child() {
    let logs = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut procctl = spawn_procctl(port, logs.path(), "trap '' TERM; sleep 30");
    let client = reqwest::Client::new();

    let health = wait_healthy(&client, port).await;
    assert_eq!(health["ok"], true);
    assert_eq!(health["childAlive"], true);
    assert!(health["pid"].as_u64().unwrap() > 0);
    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let resp: serde_json::Value = client
        .post(format!("http://127.0.0.1:{port}/shutdown"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp, serde_json::json!({"ok": true}));

    // The child ignores TERM, so the endpoint is still serving during the grace window.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let health: serde_json::Value = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["childAlive"], false);
    assert!(procctl.try_wait().unwrap().is_none());

    let status = wait_exit(&mut procctl, Duration::from_secs(10));
    assert!(status.success());
    assert!(started.elapsed() >= Duration::from_millis(1900));
}

#[tokio::test]
async fn child_exit_code_is_mirrored() {
    let logs = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut procctl = spawn_procctl(port, logs.path(), "sleep 0.2; exit 3");
    let status = wait_exit(&mut procctl, Duration::from_secs(10));
    assert_eq!(status.code(), Some(3));
}

#[tokio::test]
async fn child_signal_death_is_reraised() {
    use std::os::unix::process::ExitStatusExt;

    let logs = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut procctl = spawn_procctl(port, logs.path(), "kill -USR1 $$");
    let status = wait_exit(&mut procctl, Duration::from_secs(10));
    assert_eq!(status.signal(), Some(libc::SIGUSR1));
}
