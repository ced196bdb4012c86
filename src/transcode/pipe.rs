#![forbid(unsafe_code)]

// Chunk pipe - ordered, backpressure-aware writes into transcoder stdin

use super::types::ChunkStatus;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Write side of a transcoder's input.
///
/// Chunks are queued to a dedicated writer task so `write` never blocks.
/// `buffered` counts bytes queued but not yet accepted by the writer; once it
/// exceeds the high-water mark `write` reports `Busy` and callers should await
/// `wait_drained` before sending more.
pub struct ChunkPipe {
    room_code: String,
    tx: StdMutex<Option<mpsc::UnboundedSender<Bytes>>>,
    buffered: AtomicUsize,
    high_water: usize,
    closed: AtomicBool,
    drained: Notify,
}

impl ChunkPipe {
    /// Spawn the writer task over `writer` and return the pipe handle.
    pub fn spawn<W>(room_code: String, writer: W, high_water: usize) -> (Arc<Self>, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipe = Arc::new(Self {
            room_code,
            tx: StdMutex::new(Some(tx)),
            buffered: AtomicUsize::new(0),
            high_water,
            closed: AtomicBool::new(false),
            drained: Notify::new(),
        });
        let task = tokio::spawn(Arc::clone(&pipe).run_writer(writer, rx));
        (pipe, task)
    }

    async fn run_writer<W>(self: Arc<Self>, mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(chunk) = rx.recv().await {
            let len = chunk.len();
            let result = writer.write_all(&chunk).await;
            let remaining = self.buffered.fetch_sub(len, Ordering::AcqRel) - len;
            if let Err(e) = result {
                warn!("Transcoder input for room {} failed: {}", self.room_code, e);
                break;
            }
            if remaining == 0 {
                self.drained.notify_waiters();
            }
        }

        // End of input: flush and shut down so the transcoder sees EOF
        if let Err(e) = writer.shutdown().await {
            debug!("Closing transcoder input for room {}: {}", self.room_code, e);
        }
        self.closed.store(true, Ordering::Release);
        self.buffered.store(0, Ordering::Release);
        self.drained.notify_waiters();
        debug!("Transcoder input writer for room {} finished", self.room_code);
    }

    /// Queue a chunk. Returns `None` once the pipe is closed.
    pub fn write(&self, chunk: Bytes) -> Option<ChunkStatus> {
        if self.is_closed() {
            return None;
        }
        let len = chunk.len();
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = tx.as_ref()?;
        // Count before sending so the writer never subtracts first
        let buffered = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        if tx.send(chunk).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return None;
        }
        if buffered > self.high_water {
            Some(ChunkStatus::Busy)
        } else {
            Some(ChunkStatus::Accepted)
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once every queued byte was handed to the writer, or the pipe closed.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.buffered() == 0 || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting chunks. Already queued chunks are still written, then
    /// the writer shuts down its end so the transcoder sees end-of-input.
    pub fn close(&self) {
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.take().is_some() {
            debug!("Closing chunk pipe for room {}", self.room_code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_chunks_arrive_in_order_and_close_sends_eof() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let (pipe, task) = ChunkPipe::spawn("ABC123".into(), writer, 1024);

        for part in ["one,", "two,", "three"] {
            assert_eq!(pipe.write(Bytes::from(part)), Some(ChunkStatus::Accepted));
        }
        pipe.close();
        assert_eq!(pipe.write(Bytes::from_static(b"late")), None);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "one,two,three");

        task.await.unwrap();
        assert!(pipe.is_closed());
    }

    #[tokio::test]
    async fn test_busy_above_high_water_then_drains() {
        // Small duplex buffer: the writer stalls until the reader catches up
        let (writer, mut reader) = tokio::io::duplex(64);
        let (pipe, _task) = ChunkPipe::spawn("ABC123".into(), writer, 1024);

        let chunk = Bytes::from(vec![7u8; 512]);
        let mut statuses = Vec::new();
        for _ in 0..8 {
            statuses.push(pipe.write(chunk.clone()).unwrap());
        }
        assert_eq!(statuses[0], ChunkStatus::Accepted);
        assert!(statuses.contains(&ChunkStatus::Busy));
        assert!(pipe.buffered() > 1024);

        let reading = tokio::spawn(async move {
            let mut total = 0usize;
            let mut buf = [0u8; 256];
            while total < 8 * 512 {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            (total, reader)
        });

        tokio::time::timeout(Duration::from_secs(5), pipe.wait_drained())
            .await
            .expect("pipe should drain once the reader catches up");
        assert_eq!(pipe.buffered(), 0);
        assert_eq!(pipe.write(Bytes::from_static(b"x")), Some(ChunkStatus::Accepted));

        let (total, _reader) = reading.await.unwrap();
        assert_eq!(total, 8 * 512);
    }

    #[tokio::test]
    async fn test_wait_drained_returns_when_reader_goes_away() {
        let (writer, reader) = tokio::io::duplex(16);
        let (pipe, task) = ChunkPipe::spawn("ABC123".into(), writer, 8);
        assert_eq!(pipe.write(Bytes::from(vec![1u8; 64])), Some(ChunkStatus::Busy));

        drop(reader);
        tokio::time::timeout(Duration::from_secs(5), pipe.wait_drained())
            .await
            .expect("broken pipe must release waiters");
        task.await.unwrap();
        assert!(pipe.is_closed());
        assert_eq!(pipe.write(Bytes::from_static(b"x")), None);
    }
}
