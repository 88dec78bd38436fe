//! Single-Shot TCP Transport
//!
//! Every exchange in the cluster is one request per connection: connect,
//! write one frame, optionally read one reply, close. Peers read a single
//! chunk rather than framing the stream; frames above [`MAX_FRAME`] are not
//! part of the contract.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Connect/read timeout for all network I/O.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single request or reply frame.
pub const MAX_FRAME: usize = 64 * 1024;

/// Send one frame to `host:port` and optionally wait for one reply.
///
/// Returns `Ok(None)` when the peer closes without replying (the deferred
/// response path) or when no reply was requested.
pub async fn send_request(
    host: &str,
    port: u16,
    frame: &str,
    io_timeout: Duration,
    await_reply: bool,
) -> Result<Option<String>, String> {
    let mut stream = tokio::time::timeout(io_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| format!("Connection timeout to {}:{}", host, port))?
        .map_err(|e| format!("Failed to connect to {}:{}: {}", host, port, e))?;

    stream
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| format!("Failed to send to {}:{}: {}", host, port, e))?;

    if !await_reply {
        return Ok(None);
    }

    let reply = read_frame(&mut stream, io_timeout).await?;
    Ok(if reply.is_empty() { None } else { Some(reply) })
}

/// Read one frame (a single chunk) from the stream.
///
/// An empty string means the peer closed its write side without sending.
pub async fn read_frame(stream: &mut TcpStream, io_timeout: Duration) -> Result<String, String> {
    let mut buffer = vec![0u8; MAX_FRAME];
    let n = tokio::time::timeout(io_timeout, stream.read(&mut buffer))
        .await
        .map_err(|_| "Read timeout".to_string())?
        .map_err(|e| format!("Read error: {}", e))?;

    buffer.truncate(n);
    String::from_utf8(buffer).map_err(|e| format!("Frame is not UTF-8: {}", e))
}

/// Write one reply frame; the connection is closed by dropping the stream.
pub async fn write_reply(stream: &mut TcpStream, frame: &str) -> Result<(), String> {
    stream
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| format!("Failed to write reply: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream, IO_TIMEOUT).await.unwrap();
            assert_eq!(frame, "ping");
            write_reply(&mut stream, "pong").await.unwrap();
        });

        let reply = send_request("127.0.0.1", port, "ping", IO_TIMEOUT, true)
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_silent_close_is_no_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream, IO_TIMEOUT).await;
            // drop without replying
        });

        let reply = send_request("127.0.0.1", port, "ping", IO_TIMEOUT, true)
            .await
            .unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_connect_failure_is_error() {
        // Port 1 is essentially never listening on a test host.
        let result = send_request("127.0.0.1", 1, "ping", Duration::from_millis(500), true).await;
        assert!(result.is_err());
    }
}
