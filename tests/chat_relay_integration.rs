use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

async fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if path.exists() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("Socket did not appear: {}", path.display());
        }
        sleep(Duration::from_millis(50)).await;
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn write_json(writer: &mut OwnedWriteHalf, value: serde_json::Value) {
    let line = serde_json::to_string(&value).unwrap();
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
    writer.flush().await.unwrap();
}

async fn read_json(reader: &mut BufReader<OwnedReadHalf>) -> serde_json::Value {
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a frame")
        .unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

async fn post_hook(port: u16, path: &str, body: &str) -> u16 {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut stream = loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => break stream,
            Err(_) if Instant::now() < deadline => sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("Hook endpoint not reachable: {}", e),
        }
    };
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.start_kill();
    }
}

#[tokio::test]
async fn test_end_to_end_socket_and_hook() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("bridge.sock");
    let config_path = dir.path().join("config.json");
    let port = free_port();

    let config = json!({
        "socket": { "path": socket_path, "platform": "socket" },
        "hook": { "bind": format!("127.0.0.1:{}", port) },
        "allow": { "socket": ["alice"] },
        "history": { "root": dir.path().join("history") },
        "tools": {
            "claude": { "command": ["claude"], "uses_hook": true, "hook_format": "claude" }
        }
    });
    std::fs::write(&config_path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

    let child = Command::new(env!("CARGO_BIN_EXE_chat-relay"))
        .arg("--config")
        .arg(&config_path)
        .arg("--log-level")
        .arg("error")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut child = KillOnDrop(child);

    wait_for_socket(&socket_path).await;

    let stream = UnixStream::connect(&socket_path).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_json(
        &mut writer,
        json!({
            "type": "message",
            "user_id": "alice",
            "channel_id": "general",
            "content": "hello"
        }),
    )
    .await;
    assert_eq!(read_json(&mut reader).await["type"], "accepted");

    let reply = read_json(&mut reader).await;
    assert_eq!(reply["type"], "reply");
    assert_eq!(reply["channel_id"], "general");
    assert!(reply["text"].as_str().unwrap().contains("No active session"));

    assert_eq!(post_hook(port, "/hook", "{}").await, 400);
    assert_eq!(
        post_hook(port, "/hook?cli_type=claude", r#"{"cwd":"/nowhere"}"#).await,
        404
    );

    write_json(&mut writer, json!({"type": "shutdown"})).await;
    assert_eq!(read_json(&mut reader).await["type"], "shutdown_ack");

    let status = timeout(Duration::from_secs(10), child.0.wait())
        .await
        .expect("bridge did not exit")
        .unwrap();
    assert!(status.success());
    assert!(!socket_path.exists());
}
