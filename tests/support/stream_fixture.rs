//! Test fixtures: SSE bodies and a raw HTTP upstream for failure scenarios

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("flow")
}

/// Load an `.sse` fixture, normalizing line endings.
pub fn load_sse_fixture(name: &str) -> String {
    std::fs::read_to_string(fixtures_dir().join(name))
        .expect("read fixture")
        .replace("\r\n", "\n")
}

/// Build an SSE body with one `data:` line per payload.
pub fn sse_body(payloads: &[&str]) -> String {
    payloads
        .iter()
        .map(|p| format!("data: {p}\n\n"))
        .collect()
}

/// How the raw upstream ends its response after the given chunks
#[derive(Debug, Clone, Copy)]
pub enum Ending {
    /// Close the connection in the middle of the chunked body
    Drop,
    /// Keep the connection open and send nothing more
    Stall(Duration),
}

/// Spawn a one-shot HTTP/1.1 server that answers with a chunked
/// `text/event-stream` body made of `chunks`, then ends as described.
///
/// Returns the base URL to use as the flow API address.
pub async fn spawn_raw_upstream(chunks: Vec<String>, ending: Ending) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        read_request(&mut socket).await;

        let mut out = String::from(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
        );
        for chunk in &chunks {
            out.push_str(&format!("{:x}\r\n{chunk}\r\n", chunk.len()));
        }
        socket.write_all(out.as_bytes()).await.expect("write");
        socket.flush().await.expect("flush");

        match ending {
            Ending::Drop => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(socket);
            }
            Ending::Stall(duration) => {
                tokio::time::sleep(duration).await;
                drop(socket);
            }
        }
    });

    format!("http://{addr}")
}

/// Consume the request head and its `content-length` body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = socket.read(&mut tmp).await.expect("read");
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(head_end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < head_end + 4 + length {
                let n = socket.read(&mut tmp).await.expect("read body");
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            return;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
