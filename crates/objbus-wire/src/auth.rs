//! SASL `EXTERNAL` authentication for socket transports.
//!
//! The client sends a single NUL byte, `AUTH EXTERNAL <hex(uid)>`, waits for
//! `OK <guid>` and answers `BEGIN`. Responses are read one byte at a time so
//! no message bytes following the handshake are consumed.

use crate::error::{WireError, WireResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Longest handshake line accepted from the server.
const MAX_LINE_LEN: usize = 4096;

/// The `AUTH` command for a numeric user id.
pub fn auth_external_command(uid: u32) -> String {
    format!("AUTH EXTERNAL {}\r\n", hex::encode(uid.to_string()))
}

fn current_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> WireResult<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => WireError::ConnectionClosed,
            _ => WireError::Io(e),
        })?;
        line.push(byte);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line)
                .map_err(|_| WireError::Auth("non UTF-8 response".into()));
        }
        if line.len() > MAX_LINE_LEN {
            return Err(WireError::Auth("response line too long".into()));
        }
    }
}

/// Run the client side of the handshake. Returns the server GUID.
pub async fn authenticate<S>(stream: &mut S) -> WireResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    authenticate_as(stream, current_uid()).await
}

/// Handshake with an explicit user id.
pub async fn authenticate_as<S>(stream: &mut S, uid: u32) -> WireResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(b"\0").await?;
    stream
        .write_all(auth_external_command(uid).as_bytes())
        .await?;
    stream.flush().await?;

    let response = read_line(stream).await?;
    let guid = match response.split_once(' ') {
        Some(("OK", guid)) if !guid.is_empty() => guid.to_string(),
        _ if response.starts_with("REJECTED") => {
            return Err(WireError::Auth(format!("server rejected EXTERNAL: {response}")));
        }
        _ => return Err(WireError::Auth(format!("unexpected response: {response}"))),
    };

    stream.write_all(b"BEGIN\r\n").await?;
    stream.flush().await?;
    debug!(guid = %guid, "Authenticated with EXTERNAL");
    Ok(guid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixStream;

    #[test]
    fn test_command_encoding() {
        assert_eq!(auth_external_command(1000), "AUTH EXTERNAL 31303030\r\n");
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let server_task = tokio::spawn(async move {
            let mut server = tokio::io::BufReader::new(server);
            let nul = server.read_u8().await.unwrap();
            assert_eq!(nul, 0);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            assert_eq!(line, "AUTH EXTERNAL 3432\r\n");
            server
                .get_mut()
                .write_all(b"OK 0123456789abcdef\r\n")
                .await
                .unwrap();
            line.clear();
            server.read_line(&mut line).await.unwrap();
            assert_eq!(line, "BEGIN\r\n");
        });

        let guid = authenticate_as(&mut client, 42).await.unwrap();
        assert_eq!(guid, "0123456789abcdef");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(b"REJECTED EXTERNAL\r\n").await;
        });
        let err = authenticate_as(&mut client, 42).await.unwrap_err();
        assert!(matches!(err, WireError::Auth(_)));
    }

    #[tokio::test]
    async fn test_handshake_server_hangs_up() {
        let (mut client, server) = UnixStream::pair().unwrap();
        drop(server);
        assert!(authenticate_as(&mut client, 42).await.is_err());
    }
}
