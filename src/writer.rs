//! Per-client writer task.
//!
//! Each connection gets a dedicated writer task that owns the socket's write
//! half and receives ready-to-send frames through a bounded mpsc channel.
//! Senders never wait: [`WriterHandle::try_send`] either queues the frame or
//! fails immediately, so the dispatcher and the broadcast fan-out cannot be
//! stalled by a slow peer.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher ─┐
//! Broadcast  ─┴─► mpsc::Sender<Bytes> ─► Writer Task ─► TCP write half
//! ```
//!
//! Dropping every [`WriterHandle`] closes the channel; the writer task then
//! drains what is queued, shuts the write half down and exits.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{HomewireError, Result};

/// Default number of frames that may wait for the socket.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Maximum frames to write before flushing.
const MAX_BATCH_SIZE: usize = 8;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Sending side of a client's frame queue.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue a frame without waiting.
    ///
    /// Fails with `QueueFull` when every slot is taken and with
    /// `ConnectionClosed` when the writer task is gone.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HomewireError::QueueFull {
                slots: self.tx.max_capacity(),
            },
            mpsc::error::TrySendError::Closed(_) => HomewireError::ConnectionClosed,
        })
    }

    /// Frames waiting for the socket.
    #[inline]
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for queueing frames.
///
/// The task finishes with `Ok(())` once every handle is dropped, or with the
/// first write error.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    (WriterHandle { tx }, tokio::spawn(writer_loop(rx, writer)))
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Drain the queue onto the socket, flushing after each burst.
async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        writer.write_all(&first).await?;
        for _ in 1..MAX_BATCH_SIZE {
            let Ok(frame) = rx.try_recv() else {
                break;
            };
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
    }

    // Channel closed: every handle dropped, the session is gone.
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    #[tokio::test]
    async fn test_try_send_writes_frame() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        handle.try_send(Bytes::from_static(b"5;hello")).unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"5;hello");
    }

    #[tokio::test]
    async fn test_frames_keep_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        for i in 0..10u8 {
            handle.try_send(Bytes::from(vec![b'0' + i])).unwrap();
        }

        let mut buf = vec![0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123456789");
        assert_eq!(handle.queued(), 0);
    }

    #[tokio::test]
    async fn test_queue_full_reports_slots() {
        let (client, _server) = duplex(1);
        let (handle, _task) = spawn_writer_task(client, WriterConfig { channel_capacity: 1 });

        // The writer task blocks on the 1-byte pipe, so the queue fills up.
        let mut full_at = None;
        for _ in 0..8 {
            if let Err(HomewireError::QueueFull { slots }) =
                handle.try_send(Bytes::from_static(b"0123456789"))
            {
                full_at = Some(slots);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(full_at, Some(1));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());

        let mut buf = Vec::new();
        let n = server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_try_send_after_writer_exit() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task_default(client);

        handle.try_send(Bytes::from_static(b"x")).unwrap();
        assert!(task.await.unwrap().is_err());

        assert!(matches!(
            handle.try_send(Bytes::from_static(b"y")),
            Err(HomewireError::ConnectionClosed)
        ));
        assert!(handle.is_closed());
    }
}
