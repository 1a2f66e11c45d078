//! Transfer engine: per-session workers that move bytes between disk and the
//! session lanes and report every step to the coordinator.
//!
//! One outgoing worker streams the peer's active outgoing jobs in enqueue
//! order; one incoming worker handles the peer's frames. Both stop when the
//! session token is cancelled. Nothing here holds the coordinator lock across
//! disk or network I/O.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aero_core::chunk::MAX_CHUNK_SIZE;
use aero_core::integrity::{checksum_matches, StreamChecksum};
use aero_core::{
    Action, ChunkSizer, Coordinator, DeviceId, FailureReason, FileMeta, JobError, JobId,
    ThroughputMeter, TransferJob,
};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{SecureChannel, SessionHandle};
use crate::transport::{
    read_ack, read_meta, receive_payload, send, write_ack, write_meta, AckOutcome, Progress,
    TransportError,
};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub verify_checksums: bool,
    /// How long the sender waits for `OK`/`NO`, and for a resume answer.
    pub ack_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("disk error: {0}")]
    Disk(#[source] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Job(#[from] JobError),
}

impl EngineError {
    fn failure(&self) -> FailureReason {
        match self {
            EngineError::Disk(e)
            | EngineError::Transport(TransportError::Source(e))
            | EngineError::Transport(TransportError::Sink(e)) => FailureReason::Disk(e.to_string()),
            EngineError::Transport(TransportError::IncompleteTransfer { expected, received }) => {
                FailureReason::Incomplete {
                    expected: *expected,
                    received: *received,
                }
            }
            EngineError::Transport(e) => FailureReason::Protocol(e.to_string()),
            EngineError::Protocol(m) => FailureReason::Protocol(m.clone()),
            EngineError::Job(e) => FailureReason::Protocol(e.to_string()),
        }
    }
}

/// Cancellation tokens of jobs with I/O in flight.
#[derive(Debug, Clone, Default)]
pub struct JobTokens(Arc<std::sync::Mutex<HashMap<JobId, CancellationToken>>>);

impl JobTokens {
    fn register(&self, id: JobId, session: &CancellationToken) -> CancellationToken {
        let token = session.child_token();
        if let Ok(mut map) = self.0.lock() {
            map.insert(id, token.clone());
        }
        token
    }

    fn remove(&self, id: JobId) {
        if let Ok(mut map) = self.0.lock() {
            map.remove(&id);
        }
    }

    /// Stop the job's I/O at the next chunk boundary.
    pub fn abort(&self, id: JobId) -> bool {
        let token = self.0.lock().ok().and_then(|mut map| map.remove(&id));
        match token {
            Some(t) => {
                t.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    coordinator: Arc<Mutex<Coordinator>>,
    actions: mpsc::UnboundedSender<Action>,
    tokens: JobTokens,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        coordinator: Arc<Mutex<Coordinator>>,
        actions: mpsc::UnboundedSender<Action>,
        config: EngineConfig,
    ) -> Self {
        Self {
            coordinator,
            actions,
            tokens: JobTokens::default(),
            config,
        }
    }

    pub fn abort(&self, job_id: JobId) -> bool {
        self.tokens.abort(job_id)
    }

    /// Start the outgoing and incoming workers for a registered session.
    pub fn spawn_session_workers(&self, handle: &SessionHandle, channel: &mut SecureChannel) {
        let peer_id = handle.peer_id;
        match channel.take_replies_reader() {
            Some(replies) => {
                tokio::spawn(self.clone().outgoing_worker(
                    peer_id,
                    handle.cancel.clone(),
                    handle.wake.clone(),
                    channel.frames_writer(),
                    replies,
                ));
            }
            None => warn!(peer_id = %peer_id, "replies lane already taken"),
        }
        match channel.take_frames_reader() {
            Some(frames) => {
                tokio::spawn(self.clone().incoming_worker(
                    peer_id,
                    handle.cancel.clone(),
                    frames,
                    channel.replies_writer(),
                ));
            }
            None => warn!(peer_id = %peer_id, "frames lane already taken"),
        }
    }

    async fn apply(
        &self,
        f: impl FnOnce(&mut Coordinator) -> Result<Vec<Action>, JobError>,
    ) -> Result<(), JobError> {
        let actions = {
            let mut c = self.coordinator.lock().await;
            f(&mut c)?
        };
        for action in actions {
            let _ = self.actions.send(action);
        }
        Ok(())
    }

    async fn fail(&self, job_id: JobId, reason: FailureReason) {
        if let Err(e) = self.apply(|c| c.fail(job_id, reason)).await {
            debug!(job_id = %job_id, error = %e, "could not mark job failed");
        }
    }

    pub async fn outgoing_worker<W, R>(
        self,
        peer_id: DeviceId,
        session: CancellationToken,
        wake: Arc<Notify>,
        mut frames: W,
        mut replies: R,
    ) where
        W: AsyncWrite + Unpin + Send,
        R: AsyncRead + Unpin + Send,
    {
        loop {
            if session.is_cancelled() {
                break;
            }
            let next = self.coordinator.lock().await.next_outgoing(peer_id);
            let Some(job) = next else {
                tokio::select! {
                    _ = session.cancelled() => break,
                    _ = wake.notified() => continue,
                }
            };
            let token = self.tokens.register(job.id, &session);
            let mut wire_used = false;
            let result = self
                .run_outgoing(&job, &mut frames, &mut replies, &token, &mut wire_used)
                .await;
            self.tokens.remove(job.id);
            let Err(e) = result else {
                continue;
            };
            if session.is_cancelled() {
                debug!(job_id = %job.id, error = %e, "outgoing transfer interrupted by session loss");
                break;
            }
            if matches!(e, EngineError::Transport(TransportError::Disconnected)) {
                // The job pauses when the session is torn down.
                debug!(job_id = %job.id, "reply lane closed, closing session");
                let _ = self.actions.send(Action::CloseSession(peer_id));
                break;
            }
            if token.is_cancelled() || matches!(e, EngineError::Job(JobError::NotFound(_))) {
                debug!(job_id = %job.id, "outgoing transfer aborted");
                if wire_used {
                    // Cancelling an active outgoing job also closes the session.
                    break;
                }
                continue;
            }
            warn!(job_id = %job.id, peer_id = %peer_id, error = %e, "outgoing transfer failed");
            self.fail(job.id, e.failure()).await;
            if wire_used {
                // The peer may be mid-frame; the stream cannot be realigned.
                let _ = self.actions.send(Action::CloseSession(peer_id));
                break;
            }
        }
        debug!(peer_id = %peer_id, "outgoing worker stopped");
    }

    async fn run_outgoing<W, R>(
        &self,
        job: &TransferJob,
        frames: &mut W,
        replies: &mut R,
        token: &CancellationToken,
        wire_used: &mut bool,
    ) -> Result<(), EngineError>
    where
        W: AsyncWrite + Unpin + Send,
        R: AsyncRead + Unpin + Send,
    {
        let total = job.total_bytes;
        let checksum = match &job.checksum {
            Some(sum) => Some(sum.clone()),
            None if self.config.verify_checksums => {
                let sum = hash_file(&job.path, total).await.map_err(EngineError::Disk)?;
                self.coordinator.lock().await.set_checksum(job.id, sum.clone())?;
                Some(sum)
            }
            None => None,
        };
        let mut file = File::open(&job.path).await.map_err(EngineError::Disk)?;

        let mut offset = 0;
        if job.bytes_transferred > 0 {
            *wire_used = true;
            offset = self.probe(job, frames, replies).await?;
            if offset != job.bytes_transferred {
                self.apply(|c| c.rebase(job.id, offset)).await?;
            }
        }
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(EngineError::Disk)?;

        let meta = FileMeta {
            name: job.file_name.clone(),
            size: total - offset,
            id: Some(job.id.to_string()),
            total: Some(total),
            offset,
            sha256: checksum,
            resume: false,
        };
        info!(job_id = %job.id, peer_id = %job.peer_id, offset, bytes = meta.size, "sending");
        *wire_used = true;
        let mut reporter = Reporter::new(self, job.id, offset, None);
        let mut sizer = ChunkSizer::new();
        send(frames, &meta, &mut file, &mut sizer, token, &mut reporter).await?;

        match read_ack(replies, self.config.ack_timeout).await? {
            AckOutcome::Accepted => self.apply(|c| c.complete(job.id, true)).await?,
            AckOutcome::NotObserved => {
                if token.is_cancelled() {
                    return Err(TransportError::Disconnected.into());
                }
                debug!(job_id = %job.id, "no ack from receiver");
                self.apply(|c| c.complete(job.id, false)).await?
            }
            AckOutcome::Rejected => self.fail(job.id, FailureReason::Rejected).await,
        }
        Ok(())
    }

    /// Ask the receiver how much of this job it holds.
    async fn probe<W, R>(&self, job: &TransferJob, frames: &mut W, replies: &mut R) -> Result<u64, EngineError>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let id = job.id.to_string();
        write_meta(frames, &FileMeta::resume_probe(&job.file_name, &id, job.total_bytes)).await?;
        let answer = tokio::time::timeout(self.config.ack_timeout, read_meta(replies))
            .await
            .map_err(|_| EngineError::Protocol("no resume answer".into()))??;
        if answer.id.as_deref() != Some(id.as_str()) {
            return Err(EngineError::Protocol("resume answer for another job".into()));
        }
        if answer.offset > job.total_bytes {
            return Err(EngineError::Protocol(format!(
                "resume offset {} past end of file",
                answer.offset
            )));
        }
        debug!(job_id = %job.id, offset = answer.offset, "receiver confirmed offset");
        Ok(answer.offset)
    }

    pub async fn incoming_worker<R, W>(
        self,
        peer_id: DeviceId,
        session: CancellationToken,
        mut frames: R,
        mut replies: W,
    ) where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let meta = tokio::select! {
                _ = session.cancelled() => break,
                m = read_meta(&mut frames) => m,
            };
            let meta = match meta {
                Ok(m) => m,
                Err(TransportError::Disconnected) => break,
                Err(e) => {
                    if !session.is_cancelled() {
                        warn!(peer_id = %peer_id, error = %e, "bad frame header, closing session");
                        let _ = self.actions.send(Action::CloseSession(peer_id));
                    }
                    break;
                }
            };
            let result = if meta.resume {
                self.answer_probe(peer_id, &meta, &mut replies).await
            } else {
                self.run_incoming(peer_id, &meta, &mut frames, &mut replies, &session)
                    .await
            };
            if let Err(e) = result {
                if !session.is_cancelled() {
                    warn!(peer_id = %peer_id, error = %e, "incoming stream failed, closing session");
                    let _ = self.actions.send(Action::CloseSession(peer_id));
                }
                break;
            }
        }
        debug!(peer_id = %peer_id, "incoming worker stopped");
    }

    async fn answer_probe<W: AsyncWrite + Unpin>(
        &self,
        peer_id: DeviceId,
        meta: &FileMeta,
        replies: &mut W,
    ) -> Result<(), EngineError> {
        let bound = {
            let mut c = self.coordinator.lock().await;
            c.bind_incoming(peer_id, meta)
        };
        let offset = match bound {
            Ok((job, actions)) => {
                for action in actions {
                    let _ = self.actions.send(action);
                }
                // A job that never stored anything may still find a stale `.part` on disk.
                if job.bytes_transferred == 0 {
                    0
                } else {
                    let held = fs::metadata(part_path(&job.path))
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    held.min(meta.total())
                }
            }
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "cannot bind resume probe");
                0
            }
        };
        let id = meta.id.clone().unwrap_or_default();
        debug!(peer_id = %peer_id, name = %meta.name, offset, "answering resume probe");
        write_meta(replies, &FileMeta::resume_answer(&meta.name, id, offset)).await?;
        Ok(())
    }

    /// One incoming frame. Job-level failures are recorded here and the
    /// stream stays usable; an `Err` means the stream itself broke.
    async fn run_incoming<R, W>(
        &self,
        peer_id: DeviceId,
        meta: &FileMeta,
        frames: &mut R,
        replies: &mut W,
        session: &CancellationToken,
    ) -> Result<(), EngineError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let bound = {
            let mut c = self.coordinator.lock().await;
            c.bind_incoming(peer_id, meta)
        };
        let job = match bound {
            Ok((job, actions)) => {
                for action in actions {
                    let _ = self.actions.send(action);
                }
                job
            }
            Err(e) => {
                warn!(peer_id = %peer_id, name = %meta.name, error = %e, "cannot accept frame");
                drain(frames, meta.size).await?;
                write_ack(replies, false).await?;
                return Ok(());
            }
        };

        let token = self.tokens.register(job.id, session);
        let result = self.receive_into(&job, meta, frames, &token).await;
        self.tokens.remove(job.id);

        match result {
            Ok(Received::Stored { part, actual }) => {
                if let (Some(expected), Some(actual)) = (&meta.sha256, &actual) {
                    if !checksum_matches(expected, actual) {
                        warn!(job_id = %job.id, %expected, %actual, "checksum mismatch, keeping partial file");
                        write_ack(replies, false).await?;
                        self.fail(job.id, FailureReason::ChecksumMismatch).await;
                        return Ok(());
                    }
                }
                let dest = unique_destination(&job.path).await;
                if let Err(e) = fs::rename(&part, &dest).await {
                    write_ack(replies, false).await?;
                    self.fail(job.id, FailureReason::Disk(e.to_string())).await;
                    return Ok(());
                }
                if dest != job.path {
                    let _ = self.coordinator.lock().await.set_path(job.id, dest.clone());
                }
                write_ack(replies, true).await?;
                info!(job_id = %job.id, path = %dest.display(), bytes = meta.total(), "file received");
                if let Err(e) = self.apply(|c| c.complete(job.id, true)).await {
                    debug!(job_id = %job.id, error = %e, "could not mark job completed");
                }
                Ok(())
            }
            Ok(Received::Refused(reason)) => {
                write_ack(replies, false).await?;
                self.fail(job.id, reason).await;
                Ok(())
            }
            Err(EngineError::Transport(TransportError::Cancelled)) => {
                debug!(job_id = %job.id, "incoming transfer cancelled");
                write_ack(replies, false).await?;
                Ok(())
            }
            Err(EngineError::Transport(TransportError::Sink(e))) => {
                write_ack(replies, false).await?;
                self.fail(job.id, FailureReason::Disk(e.to_string())).await;
                Ok(())
            }
            Err(e) => {
                if !session.is_cancelled() {
                    self.fail(job.id, e.failure()).await;
                }
                Err(e)
            }
        }
    }

    /// Payload into `<dest>.part`, continuing at `meta.offset`.
    async fn receive_into<R>(
        &self,
        job: &TransferJob,
        meta: &FileMeta,
        frames: &mut R,
        token: &CancellationToken,
    ) -> Result<Received, EngineError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let part = part_path(&job.path);
        let opened = open_part(&part, meta.offset).await;
        let mut file = match opened {
            Ok(Some(f)) => f,
            Ok(None) => {
                drain(frames, meta.size).await?;
                return Ok(Received::Refused(FailureReason::Protocol(
                    "resume offset past the partial file".into(),
                )));
            }
            Err(e) => {
                drain(frames, meta.size).await?;
                return Ok(Received::Refused(FailureReason::Disk(e.to_string())));
            }
        };
        let hasher = if self.config.verify_checksums && meta.sha256.is_some() {
            match prefix_checksum(&part, meta.offset).await {
                Ok(sum) => Some(sum),
                Err(e) => {
                    drain(frames, meta.size).await?;
                    return Ok(Received::Refused(FailureReason::Disk(e.to_string())));
                }
            }
        } else {
            None
        };
        if job.bytes_transferred != meta.offset {
            self.apply(|c| c.rebase(job.id, meta.offset)).await?;
        }
        debug!(job_id = %job.id, offset = meta.offset, bytes = meta.size, "receiving");

        let mut reporter = Reporter::new(self, job.id, meta.offset, hasher);
        receive_payload(frames, meta.size, &mut file, token, &mut reporter).await?;
        drop(file);
        Ok(Received::Stored {
            part,
            actual: reporter.hasher.map(StreamChecksum::finish_hex),
        })
    }
}

enum Received {
    Stored { part: PathBuf, actual: Option<String> },
    /// The payload was drained without being stored.
    Refused(FailureReason),
}

/// Reports progress to the coordinator and optionally hashes what passes.
struct Reporter<'a> {
    engine: &'a Engine,
    job_id: JobId,
    base: u64,
    meter: ThroughputMeter,
    hasher: Option<StreamChecksum>,
}

impl<'a> Reporter<'a> {
    fn new(engine: &'a Engine, job_id: JobId, base: u64, hasher: Option<StreamChecksum>) -> Self {
        Self {
            engine,
            job_id,
            base,
            meter: ThroughputMeter::new(Instant::now()),
            hasher,
        }
    }
}

impl Progress for Reporter<'_> {
    async fn on_chunk(&mut self, chunk: &[u8], done: u64) {
        if let Some(h) = self.hasher.as_mut() {
            h.update(chunk);
        }
        let bps = self.meter.record(chunk.len() as u64, Instant::now());
        let bytes = self.base + done;
        let job_id = self.job_id;
        if let Err(e) = self.engine.apply(|c| c.progress(job_id, bytes, bps)).await {
            debug!(job_id = %job_id, error = %e, "progress not recorded");
        }
    }
}

pub fn part_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_owned();
    s.push(".part");
    PathBuf::from(s)
}

/// `dest`, or `name (1).ext`, `name (2).ext`, ... if taken.
async fn unique_destination(dest: &Path) -> PathBuf {
    if !exists(dest).await {
        return dest.to_path_buf();
    }
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dest.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dest.with_file_name(name);
        if !exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

async fn exists(path: &Path) -> bool {
    matches!(fs::try_exists(path).await, Ok(true))
}

/// Open `.part` positioned at `offset`, dropping anything past it.
/// `None` when the file holds fewer than `offset` bytes.
async fn open_part(part: &Path, offset: u64) -> io::Result<Option<File>> {
    if let Some(dir) = part.parent() {
        fs::create_dir_all(dir).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(part)
        .await?;
    if file.metadata().await?.len() < offset {
        return Ok(None);
    }
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(Some(file))
}

/// SHA-256 of the first `len` bytes of a file, in bounded memory.
async fn hash_file(path: &Path, len: u64) -> io::Result<String> {
    Ok(prefix_checksum(path, len).await?.finish_hex())
}

async fn prefix_checksum(path: &Path, len: u64) -> io::Result<StreamChecksum> {
    let file = File::open(path).await?;
    let mut reader = file.take(len);
    let mut sum = StreamChecksum::new();
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sum.update(&buf[..n]);
    }
    Ok(sum)
}

/// Read and discard `size` payload bytes.
async fn drain<R: AsyncRead + Unpin>(r: &mut R, size: u64) -> Result<(), TransportError> {
    let copied = tokio::io::copy(&mut r.take(size), &mut tokio::io::sink()).await?;
    if copied < size {
        return Err(TransportError::IncompleteTransfer {
            expected: size,
            received: copied,
        });
    }
    Ok(())
}
