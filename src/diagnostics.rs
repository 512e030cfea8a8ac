#![forbid(unsafe_code)]

//! Bounded capture of the extractor's stderr.
//!
//! stderr has to be read while stdout is being relayed: a child blocked on a
//! full stderr pipe never writes the next stdout byte. The sink therefore
//! keeps reading until EOF no matter how much text arrives and only retains
//! the most recent `capacity` bytes for error reports.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task::JoinHandle,
};

pub const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Ring of the most recent stderr bytes.
#[derive(Debug, Clone)]
pub struct DiagnosticBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    total: u64,
}

impl DiagnosticBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(READ_CHUNK)),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if self.capacity == 0 {
            return;
        }
        let keep = if chunk.len() > self.capacity {
            &chunk[chunk.len() - self.capacity..]
        } else {
            chunk
        };
        let overflow = (self.bytes.len() + keep.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(keep);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes read from the stream, retained or not.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn truncated(&self) -> bool {
        self.total > self.bytes.len() as u64
    }

    /// Retained bytes as trimmed text. Invalid UTF-8 (including a character
    /// cut in half by truncation) is replaced rather than rejected.
    pub fn text(&self) -> String {
        let (head, tail) = self.bytes.as_slices();
        let mut joined = Vec::with_capacity(self.bytes.len());
        joined.extend_from_slice(head);
        joined.extend_from_slice(tail);
        String::from_utf8_lossy(&joined).trim().to_string()
    }
}

/// Reads `reader` to EOF, keeping the last `capacity` bytes.
pub async fn drain<R>(reader: R, capacity: usize) -> std::io::Result<DiagnosticBuffer>
where
    R: AsyncRead + Unpin,
{
    let shared = Arc::new(Mutex::new(DiagnosticBuffer::new(capacity)));
    drain_into(reader, &shared).await?;
    let buffer = shared.lock().clone();
    Ok(buffer)
}

async fn drain_into<R>(mut reader: R, buffer: &Mutex<DiagnosticBuffer>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.lock().push(&chunk[..read]);
    }
}

/// Background stderr reader for one extraction process.
pub struct DiagnosticSink {
    buffer: Arc<Mutex<DiagnosticBuffer>>,
    task: JoinHandle<()>,
}

impl DiagnosticSink {
    pub fn spawn<R>(reader: R, capacity: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(DiagnosticBuffer::new(capacity)));
        let shared = buffer.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = drain_into(reader, &shared).await {
                tracing::debug!("stderr drain stopped: {err}");
            }
        });
        Self { buffer, task }
    }

    /// Empty sink for processes whose stderr was not captured.
    pub fn detached(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(DiagnosticBuffer::new(capacity))),
            task: tokio::spawn(async {}),
        }
    }

    pub fn snapshot(&self) -> DiagnosticBuffer {
        self.buffer.lock().clone()
    }

    /// Waits up to `timeout` for stderr to reach EOF, then abandons the
    /// reader and returns whatever was captured.
    pub async fn finish(self, timeout: Duration) -> DiagnosticBuffer {
        let Self { buffer, mut task } = self;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            tracing::debug!("stderr did not close within {timeout:?}; abandoning reader");
            task.abort();
        }
        buffer.lock().clone()
    }
}
