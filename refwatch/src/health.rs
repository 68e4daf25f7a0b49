// refwatch/src/health.rs
//
// Liveness probe for process supervisors and load balancers.
//
//   GET /healthz  ->  200 {"status":"ok"}
//   anything else ->  404
//
// One request per connection; headers are read up to the blank line and
// ignored. Bind address defaults to 127.0.0.1:8080.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const MAX_HEADER_LINES: usize = 64;

pub struct HealthServer {
    listener: TcpListener,
}

impl HealthServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream).await {
                    warn!(peer = %peer, error = %e, "health probe connection error");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    for _ in 0..MAX_HEADER_LINES {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let (method, target) = (parts.next().unwrap_or_default(), parts.next().unwrap_or_default());
    debug!(method, target, "health probe request");

    let response = if method == "GET" && target == "/healthz" {
        respond("200 OK", r#"{"status":"ok"}"#)
    } else {
        respond("404 Not Found", r#"{"status":"not_found"}"#)
    };
    write.write_all(response.as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}

fn respond(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn healthz_is_ok_and_everything_else_404() {
        let server = HealthServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr   = server.local_addr().unwrap();
        let task   = tokio::spawn(server.serve());

        let ok = get(addr, "/healthz").await;
        assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(ok.ends_with(r#"{"status":"ok"}"#));

        let missing = get(addr, "/metrics").await;
        assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"));
        task.abort();
    }
}
