#![forbid(unsafe_code)]

//! Copies extractor stdout into an HTTP response body.
//!
//! The body is fed through a bounded channel. hyper only pulls from the body
//! when the client socket has room, so a slow client fills the channel, the
//! relay then waits on `send`, and stdout stops being read: the child ends up
//! blocked on its own pipe instead of the gateway buffering the stream.
//!
//! Errors after the first byte cannot change the status line any more. They
//! are reported by pushing an `Err` into the channel, which makes hyper abort
//! the response so the client sees a truncated transfer rather than a clean
//! end of stream.

use std::io;

use axum::body::Body;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use tokio::{io::AsyncRead, sync::mpsc};
use tokio_util::io::ReaderStream;

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
pub const DEFAULT_BUFFER_CHUNKS: usize = 4;

pub type BodySender = mpsc::Sender<io::Result<Bytes>>;

#[derive(Debug)]
pub enum RelayOutcome {
    /// Source reached end of stream and every chunk was handed to the body.
    Completed { bytes: u64 },
    /// The response body was dropped, i.e. the client went away.
    ClientAborted { bytes: u64 },
    SourceFailed { bytes: u64, error: io::Error },
}

impl RelayOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Completed { bytes }
            | Self::ClientAborted { bytes }
            | Self::SourceFailed { bytes, .. } => *bytes,
        }
    }
}

/// Creates the sender half used by [`relay`] and the matching response body.
pub fn body_channel(buffer_chunks: usize) -> (BodySender, Body) {
    let (tx, mut rx) = mpsc::channel(buffer_chunks.max(1));
    let body = Body::from_stream(stream::poll_fn(move |cx| rx.poll_recv(cx)));
    (tx, body)
}

/// Chunked view over a child's stdout.
pub fn chunked<R>(reader: R, chunk_size: usize) -> ReaderStream<R>
where
    R: AsyncRead,
{
    ReaderStream::with_capacity(reader, chunk_size.max(1))
}

/// Moves chunks from `source` to `sink` until the source ends, the source
/// fails, or the receiving body is dropped.
pub async fn relay<S>(mut source: S, sink: &BodySender) -> RelayOutcome
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut bytes = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = sink.closed() => return RelayOutcome::ClientAborted { bytes },
            next = source.next() => next,
        };
        match next {
            None => return RelayOutcome::Completed { bytes },
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                if sink.send(Ok(chunk)).await.is_err() {
                    return RelayOutcome::ClientAborted { bytes };
                }
                bytes += len;
            }
            Some(Err(error)) => return RelayOutcome::SourceFailed { bytes, error },
        }
    }
}

/// Marks the body as failed so the client observes a truncated response.
pub async fn truncate(sink: &BodySender, reason: impl Into<String>) {
    let error = io::Error::other(reason.into());
    // A closed channel means the client is gone already; nothing to report to.
    let _ = sink.send(Err(error)).await;
}
