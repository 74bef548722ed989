//! Unix domain socket transport.
//!
//! After the SASL handshake the socket is split: a reader task frames
//! inbound bytes into [`Message`]s and pushes them onto a crossbeam channel,
//! and a writer task drains an outbound queue of already-serialized frames.
//! Both tasks run on the tokio runtime that was current at connect time.

use super::Transport;
use crate::auth::authenticate;
use crate::error::{WireError, WireResult};
use crate::message::{frame_length, Message, FIXED_HEADER_LEN};
use crossbeam::channel::{unbounded, Receiver, Sender};
use objbus_types::config::BusAddress;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct UnixTransport {
    incoming: Receiver<Message>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    guid: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UnixTransport {
    /// Connect to the first `unix:path=` entry of `address`.
    pub async fn connect(address: &BusAddress, max_message_size: u32) -> WireResult<Self> {
        let path = address.unix_path().ok_or_else(|| {
            WireError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "address has no unix:path entry",
            ))
        })?;
        debug!(path = %path.display(), "Connecting to bus socket");
        let stream = UnixStream::connect(&path).await?;
        Self::from_stream(stream, max_message_size).await
    }

    /// Authenticate over an already-connected stream and start the I/O tasks.
    pub async fn from_stream(mut stream: UnixStream, max_message_size: u32) -> WireResult<Self> {
        let guid = authenticate(&mut stream).await?;
        let (reader, writer) = stream.into_split();
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let read_task = tokio::spawn(read_loop(
            reader,
            in_tx,
            Arc::clone(&closed),
            max_message_size,
        ));
        let write_task = tokio::spawn(write_loop(writer, out_rx, Arc::clone(&closed)));

        Ok(Self {
            incoming: in_rx,
            outgoing: out_tx,
            closed,
            guid,
            tasks: Mutex::new(vec![read_task, write_task]),
        })
    }

    /// GUID the server reported during authentication.
    pub fn server_guid(&self) -> &str {
        &self.guid
    }
}

/// Read one framed message. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: u32,
) -> WireResult<Option<Vec<u8>>> {
    let mut header = [0u8; FIXED_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }
    let total = frame_length(&header, max_message_size)?;
    let mut frame = vec![0u8; total];
    frame[..FIXED_HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[FIXED_HEADER_LEN..]).await?;
    Ok(Some(frame))
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: Sender<Message>,
    closed: Arc<AtomicBool>,
    max_message_size: u32,
) {
    loop {
        let frame = match read_frame(&mut reader, max_message_size).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Bus socket closed by peer");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Bus socket read failed");
                break;
            }
        };
        match Message::from_bytes(&frame, max_message_size) {
            Ok((msg, _)) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, len = frame.len(), "Dropping malformed message"),
        }
    }
    closed.store(true, Ordering::SeqCst);
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!(error = %e, "Bus socket write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Bus socket flush failed");
            break;
        }
    }
    closed.store(true, Ordering::SeqCst);
}

impl Transport for UnixTransport {
    fn send(&self, message: Message) -> WireResult<()> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        let frame = message.to_bytes()?;
        self.outgoing
            .send(frame)
            .map_err(|_| WireError::ConnectionClosed)
    }

    fn incoming(&self) -> &Receiver<Message> {
        &self.incoming
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        debug!(guid = %self.guid, "Unix transport closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }
}
