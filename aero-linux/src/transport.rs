//! Framed transport over a session lane: JSON header, raw payload, two-byte ack.

use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use aero_core::chunk::MAX_CHUNK_SIZE;
use aero_core::protocol::{ACK_OK, ACK_REJECT};
use aero_core::wire::{decode_meta, encode_meta, meta_len, MetaError, LEN_SIZE};
use aero_core::{ChunkSizer, FileMeta};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("transfer ended early: {received} of {expected} bytes")]
    IncompleteTransfer { expected: u64, received: u64 },
    #[error("source ended after {read} of {expected} bytes")]
    SourceExhausted { expected: u64, read: u64 },
    #[error("reading source failed: {0}")]
    Source(#[source] io::Error),
    #[error("writing payload failed: {0}")]
    Sink(#[source] io::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("peer disconnected")]
    Disconnected,
    #[error("unexpected ack bytes {0:?}")]
    BadAck([u8; 2]),
}

/// Called after every chunk that went through. `done` counts payload bytes of this frame.
pub trait Progress: Send {
    fn on_chunk(&mut self, chunk: &[u8], done: u64) -> impl Future<Output = ()> + Send;
}

impl Progress for () {
    async fn on_chunk(&mut self, _chunk: &[u8], _done: u64) {}
}

/// What the receiver said after a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    Rejected,
    /// Timed out or the stream ended first.
    NotObserved,
}

pub async fn write_meta<W: AsyncWrite + Unpin>(w: &mut W, meta: &FileMeta) -> Result<(), TransportError> {
    let header = encode_meta(meta)?;
    w.write_all(&header).await?;
    w.flush().await?;
    Ok(())
}

/// Header and then `meta.size` bytes from `source`, in chunks sized by `sizer`.
/// Returns the payload bytes written.
pub async fn send<W, S, P>(
    w: &mut W,
    meta: &FileMeta,
    source: &mut S,
    sizer: &mut ChunkSizer,
    cancel: &CancellationToken,
    progress: &mut P,
) -> Result<u64, TransportError>
where
    W: AsyncWrite + Unpin,
    S: AsyncRead + Unpin,
    P: Progress,
{
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled);
    }
    write_meta(w, meta).await?;
    let mut buf = vec![0u8; MAX_CHUNK_SIZE.min(meta.size as usize).max(1)];
    let mut sent = 0u64;
    while sent < meta.size {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let want = (sizer.next_size() as u64).min(meta.size - sent) as usize;
        let want = want.min(buf.len());
        let n = fill(source, &mut buf[..want])
            .await
            .map_err(TransportError::Source)?;
        if n < want {
            return Err(TransportError::SourceExhausted {
                expected: meta.size,
                read: sent + n as u64,
            });
        }
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            r = write_chunk(w, &buf[..n]) => r?,
        }
        sizer.record(n, started.elapsed());
        sent += n as u64;
        progress.on_chunk(&buf[..n], sent).await;
    }
    trace!(name = %meta.name, bytes = sent, "frame sent");
    Ok(sent)
}

async fn write_chunk<W: AsyncWrite + Unpin>(w: &mut W, chunk: &[u8]) -> io::Result<()> {
    w.write_all(chunk).await?;
    w.flush().await
}

/// Read until `buf` is full or EOF. Returns bytes read.
async fn fill<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Next frame header. EOF before the first byte is `Disconnected`.
pub async fn read_meta<R: AsyncRead + Unpin>(r: &mut R) -> Result<FileMeta, TransportError> {
    let mut prefix = [0u8; LEN_SIZE];
    r.read_exact(&mut prefix).await.map_err(eof_is_disconnect)?;
    let len = meta_len(prefix)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await.map_err(eof_is_disconnect)?;
    Ok(decode_meta(&body)?)
}

fn eof_is_disconnect(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::Disconnected
    } else {
        TransportError::Io(e)
    }
}

/// Read exactly `size` payload bytes into `sink`, flushing per chunk (at most 1 MiB).
///
/// On cancellation or a sink error the rest of the payload is still read and
/// discarded so the stream stays aligned on frame boundaries; the error is
/// returned afterwards. EOF first is `IncompleteTransfer`, with whatever did
/// arrive already written.
pub async fn receive_payload<R, K, P>(
    r: &mut R,
    size: u64,
    sink: &mut K,
    cancel: &CancellationToken,
    progress: &mut P,
) -> Result<u64, TransportError>
where
    R: AsyncRead + Unpin,
    K: AsyncWrite + Unpin,
    P: Progress,
{
    let mut buf = vec![0u8; MAX_CHUNK_SIZE.min(size as usize).max(1)];
    let mut received = 0u64;
    let mut stored = 0u64;
    let mut failure: Option<TransportError> = None;
    while received < size {
        let want = (buf.len() as u64).min(size - received) as usize;
        let n = fill(r, &mut buf[..want]).await?;
        received += n as u64;
        if failure.is_none() && cancel.is_cancelled() {
            debug!(received, size, "receive cancelled, draining payload");
            failure = Some(TransportError::Cancelled);
        }
        if failure.is_none() && n > 0 {
            match write_chunk(sink, &buf[..n]).await {
                Ok(()) => {
                    stored += n as u64;
                    progress.on_chunk(&buf[..n], stored).await;
                }
                Err(e) => {
                    debug!(error = %e, "sink write failed, draining payload");
                    failure = Some(TransportError::Sink(e));
                }
            }
        }
        if n < want {
            return Err(TransportError::IncompleteTransfer {
                expected: size,
                received,
            });
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(received),
    }
}

pub async fn write_ack<W: AsyncWrite + Unpin>(w: &mut W, ok: bool) -> Result<(), TransportError> {
    w.write_all(if ok { &ACK_OK } else { &ACK_REJECT }).await?;
    w.flush().await?;
    Ok(())
}

/// A timeout is `NotObserved`; EOF means the lane closed under us and is `Disconnected`.
pub async fn read_ack<R: AsyncRead + Unpin>(r: &mut R, timeout: Duration) -> Result<AckOutcome, TransportError> {
    let mut ack = [0u8; 2];
    let read = tokio::time::timeout(timeout, r.read_exact(&mut ack)).await;
    match read {
        Err(_) => Ok(AckOutcome::NotObserved),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(TransportError::Disconnected)
        }
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(_)) if ack == ACK_OK => Ok(AckOutcome::Accepted),
        Ok(Ok(_)) if ack == ACK_REJECT => Ok(AckOutcome::Rejected),
        Ok(Ok(_)) => Err(TransportError::BadAck(ack)),
    }
}
