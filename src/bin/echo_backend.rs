//! A minimal backend for demos and integration tests.
//!
//! Listens on the port given by the PORT environment variable and speaks
//! just enough HTTP/1.1 to stand in for a terminal backend:
//! - plain requests get a 200 with a body identifying the instance
//! - `/env/NAME` returns the value of that environment variable
//! - upgrade requests get a 101 and the raw byte stream is echoed back
//!
//! STARTUP_DELAY_MS delays listening, to exercise startup-confirmation
//! handling in the gateway. UPGRADE_BANNER, when set, is pushed in the
//! same write as the 101, the way terminal backends paint the initial
//! screen without waiting for client input.

use anyhow::Context;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT")
        .context("PORT environment variable not set")?
        .parse()
        .context("PORT is not a valid port number")?;

    let tag = std::env::args().nth(1).unwrap_or_else(|| "echo".to_string());

    if let Ok(delay) = std::env::var("STARTUP_DELAY_MS") {
        let ms: u64 = delay.parse().context("STARTUP_DELAY_MS is not a number")?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{}", port))?;
    eprintln!("echo-backend [{}] listening on 127.0.0.1:{}", tag, port);

    loop {
        let (stream, _) = listener.accept().await?;
        let tag = tag.clone();
        tokio::spawn(async move {
            let _ = handle_connection(stream, &tag, port).await;
        });
    }
}

async fn handle_connection(mut stream: TcpStream, tag: &str, port: u16) -> anyhow::Result<()> {
    let head = read_request_head(&mut stream).await?;

    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let is_upgrade = head
        .lines()
        .any(|line| line.to_ascii_lowercase().starts_with("upgrade:"));

    if is_upgrade {
        let banner = std::env::var("UPGRADE_BANNER").unwrap_or_default();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\r\n{}",
            banner
        );
        stream.write_all(response.as_bytes()).await?;
        // Echo raw bytes until the peer closes
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
        }
        return Ok(());
    }

    let body = if let Some(name) = path.strip_prefix("/env/") {
        std::env::var(name).unwrap_or_default()
    } else {
        format!("ok {} port={} path={}", tag, port, path)
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Read until the end of the request headers
async fn read_request_head(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > 64 * 1024 {
            anyhow::bail!("request head too large");
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}
