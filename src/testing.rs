//! Local servers for exercising streaming edge cases that mock HTTP servers cannot
//! produce (chunk timing, connection resets mid-body).

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::{Client, Config, RetryConfig};

/// How a chunked test response ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnding {
    /// Write the terminating zero-length chunk.
    Finish,
    /// Close the socket without the terminating chunk.
    Reset,
}

/// Create a test client for `base_url` with retries disabled.
pub fn test_client(base_url: &str) -> Client {
    Client::new(Config {
        base_url: Some(base_url.to_string()),
        retry: Some(RetryConfig::disabled()),
        ..Default::default()
    })
    .expect("client")
}

/// Start a one-shot server that streams each line as its own HTTP chunk (with a
/// trailing `\n`) after the given delay, then ends as `ending` says.
pub async fn start_chunked_sse_server(
    steps: Vec<(Duration, String)>,
    ending: StreamEnding,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (mut socket, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };

        // Read request headers.
        let mut buf = [0u8; 4096];
        let mut received = Vec::new();
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            if n == 0 {
                return;
            }
            received.extend_from_slice(&buf[..n]);
            if received.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let headers = concat!(
            "HTTP/1.1 200 OK\r\n",
            "Content-Type: text/event-stream\r\n",
            "Cache-Control: no-cache\r\n",
            "Transfer-Encoding: chunked\r\n",
            "\r\n"
        );
        if socket.write_all(headers.as_bytes()).await.is_err() {
            return;
        }

        for (delay, line) in steps {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let payload = format!("{line}\n");
            let chunk = format!("{:X}\r\n{}\r\n", payload.len(), payload);
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
        }
        let _ = socket.flush().await;

        match ending {
            StreamEnding::Finish => {
                let _ = socket.write_all(b"0\r\n\r\n").await;
            }
            StreamEnding::Reset => {
                // Give the client a moment to read what was sent.
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(socket);
            }
        }
    });

    format!("http://{}", addr)
}

/// Start a server that immediately emits all lines and finishes cleanly.
pub async fn start_sse_server(lines: Vec<String>) -> String {
    let steps = lines
        .into_iter()
        .map(|line| (Duration::from_millis(0), line))
        .collect();
    start_chunked_sse_server(steps, StreamEnding::Finish).await
}
