//! Session negotiator: handshake over TCP, encrypted lanes, and the registry
//! that keeps at most one live session per node.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use aero_core::identity::{decrypt_wire, encrypt_wire, handshake_nonce, Transcript, WireCryptoError};
use aero_core::wire::{frame_len, LEN_SIZE};
use aero_core::{
    Action, AuthMode, Coordinator, DeviceClass, DeviceId, Hello, Keypair, Peer, PublicKey,
    SessionKeys, TrustCheck, TrustedPeer, VerificationCode, PROTOCOL_VERSION,
};
use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, info, trace, warn};

/// Records the writer task may have queued before senders wait.
pub const WRITE_QUEUE_RECORDS: usize = 4;
/// Inbound records buffered per lane before the reader task waits.
const LANE_QUEUE_RECORDS: usize = 16;
/// Largest data part of a record; the plaintext adds one lane byte.
pub const MAX_RECORD_DATA: usize = 64 * 1024;
const TAG_LEN: usize = 16;

const CONFIRM: &[u8] = b"aerosync-confirm";
const VERDICT_ACCEPT: &[u8] = b"accept";
const VERDICT_REJECT: &[u8] = b"reject";
/// Nonces 0 and 1 in each direction carry the confirmation and the verdict.
const FIRST_CHANNEL_NONCE: u64 = 2;
/// Default gap after which an idle writer sends an empty control record.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lane {
    Control = 0,
    /// File frames travelling from their sender to the receiver.
    Frames = 1,
    /// Resume answers and acks travelling back to the frame sender.
    Replies = 2,
}

impl TryFrom<u8> for Lane {
    type Error = RecordError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(Lane::Control),
            1 => Ok(Lane::Frames),
            2 => Ok(Lane::Replies),
            other => Err(RecordError::UnknownLane(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer unreachable: {0}")]
    Unreachable(#[source] io::Error),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("peer not trusted: {0}")]
    Untrusted(String),
    #[error("session closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("record length {0} out of range")]
    BadLength(usize),
    #[error(transparent)]
    Crypto(#[from] WireCryptoError),
    #[error("unknown lane {0}")]
    UnknownLane(u8),
}

impl RecordError {
    fn is_eof(&self) -> bool {
        matches!(self, RecordError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    key: &[u8; 32],
    nonce: u64,
    lane: Lane,
    data: &[u8],
) -> Result<(), RecordError> {
    let mut plain = Vec::with_capacity(1 + data.len());
    plain.push(lane as u8);
    plain.extend_from_slice(data);
    let cipher = encrypt_wire(key, nonce, &plain)?;
    let len = u32::try_from(cipher.len()).map_err(|_| RecordError::BadLength(cipher.len()))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&cipher).await?;
    w.flush().await?;
    Ok(())
}

async fn read_record<R: AsyncRead + Unpin>(
    r: &mut R,
    key: &[u8; 32],
    nonce: u64,
) -> Result<(Lane, Bytes), RecordError> {
    let mut prefix = [0u8; LEN_SIZE];
    r.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if !(TAG_LEN + 1..=TAG_LEN + 1 + MAX_RECORD_DATA).contains(&len) {
        return Err(RecordError::BadLength(len));
    }
    let mut cipher = vec![0u8; len];
    r.read_exact(&mut cipher).await?;
    let plain = decrypt_wire(key, nonce, &cipher)?;
    let lane = Lane::try_from(plain[0])?;
    Ok((lane, Bytes::from(plain).slice(1..)))
}

/// This node as presented in its `Hello`.
#[derive(Clone)]
pub struct LocalIdentity {
    pub keypair: Arc<Keypair>,
    pub display_name: String,
    pub device_class: DeviceClass,
}

/// How peers that are not pinned yet are treated.
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    TrustOnFirstUse,
    /// Ask the UI to compare the verification code.
    Prompt(mpsc::Sender<AuthPrompt>),
    TrustedOnly,
}

/// A new peer waiting for the user's decision. Dropping it rejects.
#[derive(Debug)]
pub struct AuthPrompt {
    pub peer_id: DeviceId,
    pub display_name: String,
    pub fingerprint: String,
    pub code: VerificationCode,
    reply: oneshot::Sender<bool>,
}

impl AuthPrompt {
    pub fn accept(self) {
        let _ = self.reply.send(true);
    }

    pub fn reject(self) {
        let _ = self.reply.send(false);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NegotiatorConfig {
    pub connect_timeout: Duration,
    /// Bounds the network phases of the handshake.
    pub handshake_timeout: Duration,
    /// Bounds a local prompt; the peer's verdict may take this long on top of the handshake.
    pub auth_prompt_timeout: Duration,
    /// Idle gap before the channel sends a keepalive. Keep it under the offline timeout.
    pub keepalive_interval: Duration,
}

/// A handshake that completed on both sides.
pub struct Established {
    pub peer_id: DeviceId,
    pub peer_name: String,
    pub peer_class: DeviceClass,
    pub auth_mode: AuthMode,
    pub initiator: bool,
    pub code: VerificationCode,
    pub channel: SecureChannel,
    /// The peer was pinned by this handshake; the trust store changed.
    pub pinned: bool,
    /// Coordinator actions produced by pinning.
    pub actions: Vec<Action>,
}

struct Secured {
    hello: Hello,
    keys: SessionKeys,
}

pub struct Negotiator {
    identity: LocalIdentity,
    coordinator: Arc<Mutex<Coordinator>>,
    policy: AuthPolicy,
    config: NegotiatorConfig,
}

impl Negotiator {
    pub fn new(
        identity: LocalIdentity,
        coordinator: Arc<Mutex<Coordinator>>,
        policy: AuthPolicy,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            identity,
            coordinator,
            policy,
            config,
        }
    }

    pub fn local_id(&self) -> DeviceId {
        self.identity.keypair.device_id()
    }

    /// Dial a discovered peer and run the handshake as initiator.
    pub async fn connect(&self, peer: &Peer) -> Result<Established, SessionError> {
        debug!(peer_id = %peer.id, addr = %peer.address, "connecting");
        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(peer.address)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(SessionError::Unreachable(e)),
            Err(_) => {
                return Err(SessionError::Unreachable(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        self.negotiate(stream, true, Some(&peer.public_key)).await
    }

    /// Run the handshake on an inbound connection as responder.
    pub async fn accept(&self, stream: TcpStream) -> Result<Established, SessionError> {
        let _ = stream.set_nodelay(true);
        self.negotiate(stream, false, None).await
    }

    /// Full handshake on any byte stream. `expected` is the key discovery advertised.
    pub async fn negotiate<S>(
        &self,
        stream: S,
        initiator: bool,
        expected: Option<&PublicKey>,
    ) -> Result<Established, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut r, mut w) = tokio::io::split(stream);
        let secured = tokio::time::timeout(
            self.config.handshake_timeout,
            self.secure(&mut r, &mut w, initiator, expected),
        )
        .await
        .map_err(|_| SessionError::HandshakeFailed("timed out".into()))??;
        let peer_id = secured.hello.device_id;
        let code = secured.keys.verification_code();

        let decision = self.decide(&secured.hello, code).await;
        let verdict = if decision.is_ok() { VERDICT_ACCEPT } else { VERDICT_REJECT };
        let peer_verdict = tokio::time::timeout(
            self.config.handshake_timeout + self.config.auth_prompt_timeout,
            async {
                write_record(&mut w, &secured.keys.send, 1, Lane::Control, verdict).await?;
                read_record(&mut r, &secured.keys.recv, 1).await
            },
        )
        .await;
        let (mode, needs_pin) = decision?;
        match peer_verdict {
            Ok(Ok((Lane::Control, data))) if data.as_ref() == VERDICT_ACCEPT => {}
            Ok(Ok((Lane::Control, data))) if data.as_ref() == VERDICT_REJECT => {
                return Err(SessionError::Untrusted("peer rejected the session".into()))
            }
            Ok(Ok(_)) => return Err(SessionError::HandshakeFailed("malformed verdict".into())),
            Ok(Err(e)) => return Err(SessionError::HandshakeFailed(e.to_string())),
            Err(_) => return Err(SessionError::HandshakeFailed("timed out waiting for verdict".into())),
        }

        let actions = if needs_pin {
            self.coordinator.lock().await.pin(TrustedPeer {
                device_id: peer_id,
                public_key: secured.hello.public_key.clone(),
                display_name: secured.hello.display_name.clone(),
                auth_mode: mode,
            })
        } else {
            Vec::new()
        };
        info!(peer_id = %peer_id, initiator, auth_mode = ?mode, "handshake complete");
        let channel = SecureChannel::spawn(
            r,
            w,
            &secured.keys,
            FIRST_CHANNEL_NONCE,
            self.config.keepalive_interval,
        );
        Ok(Established {
            peer_id,
            peer_name: secured.hello.display_name,
            peer_class: secured.hello.device_class,
            auth_mode: mode,
            initiator,
            code,
            channel,
            pinned: needs_pin,
            actions,
        })
    }

    /// Hello exchange, checks, key schedule and key confirmation.
    async fn secure<R, W>(
        &self,
        r: &mut R,
        w: &mut W,
        initiator: bool,
        expected: Option<&PublicKey>,
    ) -> Result<Secured, SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let keypair = &self.identity.keypair;
        let ours = Hello {
            protocol_version: PROTOCOL_VERSION,
            device_id: keypair.device_id(),
            public_key: keypair.public_key().clone(),
            display_name: self.identity.display_name.clone(),
            device_class: self.identity.device_class,
            nonce: handshake_nonce(),
        };
        let theirs = if initiator {
            write_hello(w, &ours).await?;
            read_hello(r).await?
        } else {
            let theirs = read_hello(r).await?;
            write_hello(w, &ours).await?;
            theirs
        };

        if theirs.protocol_version != PROTOCOL_VERSION {
            return Err(SessionError::HandshakeFailed(format!(
                "unsupported protocol version {}",
                theirs.protocol_version
            )));
        }
        if !theirs.device_id.matches(&theirs.public_key) {
            return Err(SessionError::HandshakeFailed("device id does not match public key".into()));
        }
        if theirs.device_id == ours.device_id {
            return Err(SessionError::HandshakeFailed("connected to self".into()));
        }
        if let Some(expected) = expected {
            if *expected != theirs.public_key {
                return Err(SessionError::HandshakeFailed(
                    "public key differs from the advertised one".into(),
                ));
            }
        }

        let shared = keypair.shared_secret(&theirs.public_key);
        let (i, rsp) = if initiator { (&ours, &theirs) } else { (&theirs, &ours) };
        let transcript = Transcript {
            initiator_public: &i.public_key,
            responder_public: &rsp.public_key,
            initiator_nonce: &i.nonce,
            responder_nonce: &rsp.nonce,
        };
        let keys = SessionKeys::derive(&shared, &transcript, initiator);

        write_record(w, &keys.send, 0, Lane::Control, CONFIRM)
            .await
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        match read_record(r, &keys.recv, 0).await {
            Ok((Lane::Control, data)) if data.as_ref() == CONFIRM => {}
            Ok(_) => return Err(SessionError::HandshakeFailed("bad key confirmation".into())),
            Err(e) => {
                return Err(SessionError::HandshakeFailed(format!("key confirmation: {e}")))
            }
        }
        Ok(Secured { hello: theirs, keys })
    }

    /// Trust decision. Returns the auth mode and whether the peer must be pinned.
    async fn decide(&self, hello: &Hello, code: VerificationCode) -> Result<(AuthMode, bool), SessionError> {
        let check = self
            .coordinator
            .lock()
            .await
            .trust_check(&hello.device_id, &hello.public_key);
        match check {
            TrustCheck::Trusted(mode) => Ok((mode, false)),
            TrustCheck::KeyMismatch => {
                warn!(peer_id = %hello.device_id, "pinned peer presented a different key");
                Err(SessionError::Untrusted("pinned with a different key".into()))
            }
            TrustCheck::Unknown => match &self.policy {
                AuthPolicy::TrustOnFirstUse => Ok((AuthMode::TrustOnFirstUse, true)),
                AuthPolicy::TrustedOnly => Err(SessionError::Untrusted("peer is not pinned".into())),
                AuthPolicy::Prompt(prompts) => {
                    let (reply, answer) = oneshot::channel();
                    let prompt = AuthPrompt {
                        peer_id: hello.device_id,
                        display_name: hello.display_name.clone(),
                        fingerprint: hello.public_key.fingerprint(),
                        code,
                        reply,
                    };
                    info!(peer_id = %hello.device_id, %code, "asking user to verify peer");
                    if prompts.send(prompt).await.is_err() {
                        return Err(SessionError::Untrusted("no one to ask".into()));
                    }
                    match tokio::time::timeout(self.config.auth_prompt_timeout, answer).await {
                        Ok(Ok(true)) => Ok((AuthMode::Verified, true)),
                        Ok(Ok(false)) | Ok(Err(_)) => {
                            Err(SessionError::Untrusted("rejected by user".into()))
                        }
                        Err(_) => Err(SessionError::Untrusted("verification timed out".into())),
                    }
                }
            },
        }
    }
}

async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W, hello: &Hello) -> Result<(), SessionError> {
    let bytes = aero_core::encode_frame(hello)
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
    let io = async {
        w.write_all(&bytes).await?;
        w.flush().await
    };
    io.await
        .map_err(|e| SessionError::HandshakeFailed(format!("sending hello: {e}")))
}

async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<Hello, SessionError> {
    let mut buf = vec![0u8; LEN_SIZE];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| SessionError::HandshakeFailed(format!("reading hello: {e}")))?;
    let len = frame_len([buf[0], buf[1], buf[2], buf[3]])
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
    buf.resize(LEN_SIZE + len, 0);
    r.read_exact(&mut buf[LEN_SIZE..])
        .await
        .map_err(|e| SessionError::HandshakeFailed(format!("reading hello: {e}")))?;
    let (hello, _) = aero_core::decode_frame::<Hello>(&buf)
        .map_err(|e| SessionError::HandshakeFailed(format!("bad hello: {e}")))?;
    Ok(hello)
}

type Record = (Lane, Bytes);

/// Encrypted channel after the handshake. One writer task and one reader task
/// own the stream halves and the cipher state.
pub struct SecureChannel {
    outbound: mpsc::Sender<Record>,
    frames: Option<mpsc::Receiver<Bytes>>,
    replies: Option<mpsc::Receiver<Bytes>>,
    activity: watch::Receiver<()>,
    cancel: CancellationToken,
}

impl SecureChannel {
    pub fn spawn<R, W>(r: R, w: W, keys: &SessionKeys, first_nonce: u64, keepalive: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE_RECORDS);
        let (frames_tx, frames_rx) = mpsc::channel(LANE_QUEUE_RECORDS);
        let (replies_tx, replies_rx) = mpsc::channel(LANE_QUEUE_RECORDS);
        let (activity_tx, activity_rx) = watch::channel(());
        tokio::spawn(write_loop(w, keys.send, first_nonce, keepalive, out_rx, cancel.clone()));
        tokio::spawn(read_loop(
            r,
            keys.recv,
            first_nonce,
            frames_tx,
            replies_tx,
            activity_tx,
            cancel.clone(),
        ));
        Self {
            outbound: out_tx,
            frames: Some(frames_rx),
            replies: Some(replies_rx),
            activity: activity_rx,
            cancel,
        }
    }

    /// Our outgoing file frames.
    pub fn frames_writer(&self) -> LaneWriter {
        LaneWriter::new(Lane::Frames, self.outbound.clone())
    }

    /// Resume answers and acks for the peer's frames.
    pub fn replies_writer(&self) -> LaneWriter {
        LaneWriter::new(Lane::Replies, self.outbound.clone())
    }

    /// The peer's file frames. Available once.
    pub fn take_frames_reader(&mut self) -> Option<LaneReader> {
        self.frames.take().map(LaneReader::new)
    }

    /// Answers and acks for our frames. Available once.
    pub fn take_replies_reader(&mut self) -> Option<LaneReader> {
        self.replies.take().map(LaneReader::new)
    }

    /// Marked changed whenever a record arrives, keepalives included.
    pub fn activity(&self) -> watch::Receiver<()> {
        self.activity.clone()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut w: W,
    key: [u8; 32],
    mut nonce: u64,
    keepalive: Duration,
    mut rx: mpsc::Receiver<Record>,
    cancel: CancellationToken,
) {
    let idle = tokio::time::sleep(keepalive);
    tokio::pin!(idle);
    loop {
        let (lane, data) = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(record) => record,
                None => break,
            },
            _ = &mut idle => (Lane::Control, Bytes::new()),
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            r = write_record(&mut w, &key, nonce, lane, &data) => r,
        };
        if let Err(e) = written {
            debug!(error = %e, "session write failed");
            break;
        }
        nonce += 1;
        idle.as_mut().reset(tokio::time::Instant::now() + keepalive);
    }
    cancel.cancel();
    let _ = w.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut r: R,
    key: [u8; 32],
    mut nonce: u64,
    frames: mpsc::Sender<Bytes>,
    replies: mpsc::Sender<Bytes>,
    activity: watch::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            r = read_record(&mut r, &key, nonce) => r,
        };
        let (lane, data) = match record {
            Ok(v) => v,
            Err(e) if e.is_eof() => {
                debug!("peer closed the session");
                break;
            }
            Err(e) => {
                warn!(error = %e, "session read failed");
                break;
            }
        };
        nonce += 1;
        activity.send_replace(());
        if data.is_empty() {
            continue;
        }
        let tx = match lane {
            Lane::Frames => &frames,
            Lane::Replies => &replies,
            Lane::Control => {
                trace!(len = data.len(), "ignoring control record");
                continue;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(data) => if sent.is_err() {
                trace!(?lane, "no reader for lane, record dropped");
            },
        }
    }
    // Token first: a lane reader that sees EOF can then tell it was a disconnect.
    cancel.cancel();
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

/// `AsyncWrite` into one lane. Each write becomes at most one record.
pub struct LaneWriter {
    lane: Lane,
    tx: PollSender<Record>,
}

impl LaneWriter {
    fn new(lane: Lane, tx: mpsc::Sender<Record>) -> Self {
        Self {
            lane,
            tx: PollSender::new(tx),
        }
    }
}

impl AsyncWrite for LaneWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let n = buf.len().min(MAX_RECORD_DATA);
        let lane = self.lane;
        self.tx
            .send_item((lane, Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

/// `AsyncRead` over one inbound lane. EOF when the session ends.
pub struct LaneReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl LaneReader {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for LaneReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(data) => self.pending = data,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

/// The live session as the registry sees it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub peer_id: DeviceId,
    pub initiator: bool,
    pub established_at: Instant,
    pub cancel: CancellationToken,
    /// Poked when outgoing jobs become ready.
    pub wake: Arc<Notify>,
}

/// Holds the one live session. Registering another replaces it.
pub struct SessionRegistry {
    self_id: DeviceId,
    crossing_window: Duration,
    current: std::sync::Mutex<Option<SessionHandle>>,
    connect_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Two sessions to the same peer from opposite dialers within `crossing_window`
    /// are treated as crossed connects.
    pub fn new(self_id: DeviceId, crossing_window: Duration) -> Self {
        Self {
            self_id,
            crossing_window,
            current: std::sync::Mutex::new(None),
            connect_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Serializes outbound connects.
    pub async fn lock_connect(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.connect_lock.lock().await
    }

    /// Install a session, cancelling whatever it replaces. A crossed connect
    /// keeps the session dialed by the smaller device id; the loser gets `Closed`.
    pub fn register(
        &self,
        peer_id: DeviceId,
        initiator: bool,
        cancel: CancellationToken,
    ) -> Result<SessionHandle, SessionError> {
        let mut current = self.current.lock().map_err(|_| SessionError::Closed)?;
        if let Some(existing) = current.as_ref() {
            let crossed = existing.peer_id == peer_id
                && existing.initiator != initiator
                && existing.established_at.elapsed() < self.crossing_window
                && !existing.cancel.is_cancelled();
            if crossed {
                let winner = self.self_id.min(peer_id);
                let new_dialer = if initiator { self.self_id } else { peer_id };
                if new_dialer != winner {
                    debug!(peer_id = %peer_id, initiator, "crossed connect lost");
                    cancel.cancel();
                    return Err(SessionError::Closed);
                }
            }
        }
        let handle = SessionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer_id,
            initiator,
            established_at: Instant::now(),
            cancel,
            wake: Arc::new(Notify::new()),
        };
        if let Some(old) = current.replace(handle.clone()) {
            debug!(old_peer = %old.peer_id, old_id = old.id, new_peer = %peer_id, "replacing session");
            old.cancel.cancel();
        }
        Ok(handle)
    }

    /// Forget session `id` if it is still current.
    pub fn unregister(&self, id: u64) -> bool {
        let Ok(mut current) = self.current.lock() else {
            return false;
        };
        if current.as_ref().is_some_and(|h| h.id == id) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Tear down the session to `peer_id`, if that is the live one.
    pub fn close(&self, peer_id: DeviceId) -> bool {
        match self.current() {
            Some(h) if h.peer_id == peer_id => {
                h.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn close_all(&self) {
        if let Some(h) = self.current() {
            h.cancel.cancel();
        }
    }

    pub fn wake(&self, peer_id: DeviceId) {
        if let Some(h) = self.current().filter(|h| h.peer_id == peer_id) {
            h.wake.notify_one();
        }
    }

    pub fn current(&self) -> Option<SessionHandle> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    /// Live session to `peer_id`, if any.
    pub fn live_for(&self, peer_id: DeviceId) -> Option<SessionHandle> {
        self.current()
            .filter(|h| h.peer_id == peer_id && !h.cancel.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_core::{CoordinatorConfig, TrustStore};

    fn config() -> NegotiatorConfig {
        NegotiatorConfig {
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(2),
            auth_prompt_timeout: Duration::from_secs(2),
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }

    fn side(name: &str, policy: AuthPolicy) -> (Negotiator, Arc<Keypair>, Arc<Mutex<Coordinator>>) {
        let kp = Arc::new(Keypair::generate());
        let coordinator = Arc::new(Mutex::new(Coordinator::new(
            kp.device_id(),
            CoordinatorConfig::default(),
            TrustStore::new(),
        )));
        let identity = LocalIdentity {
            keypair: kp.clone(),
            display_name: name.into(),
            device_class: DeviceClass::Laptop,
        };
        (
            Negotiator::new(identity, coordinator.clone(), policy, config()),
            kp,
            coordinator,
        )
    }

    #[tokio::test]
    async fn tofu_handshake_pins_both_sides() {
        let (a, _ka, ca) = side("A", AuthPolicy::TrustOnFirstUse);
        let (b, kb, cb) = side("B", AuthPolicy::TrustOnFirstUse);
        let (sa, sb) = tokio::io::duplex(64 * 1024);
        let (ra, rb) = tokio::join!(
            a.negotiate(sa, true, Some(kb.public_key())),
            b.negotiate(sb, false, None)
        );
        let (ea, eb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ea.peer_id, b.local_id());
        assert_eq!(eb.peer_id, a.local_id());
        assert_eq!(ea.code, eb.code);
        assert_eq!(ea.auth_mode, AuthMode::TrustOnFirstUse);
        assert!(ea.pinned && eb.pinned);
        assert!(ca.lock().await.trust_store().is_trusted(&b.local_id()));
        assert!(cb.lock().await.trust_store().is_trusted(&a.local_id()));
    }

    #[tokio::test]
    async fn lanes_carry_data_both_ways() {
        let (a, _, _) = side("A", AuthPolicy::TrustOnFirstUse);
        let (b, _, _) = side("B", AuthPolicy::TrustOnFirstUse);
        let (sa, sb) = tokio::io::duplex(8 * 1024);
        let (ra, rb) = tokio::join!(a.negotiate(sa, true, None), b.negotiate(sb, false, None));
        let (ea, mut eb) = (ra.unwrap(), rb.unwrap());

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let mut w = ea.channel.frames_writer();
        let mut r = eb.channel.take_frames_reader().unwrap();
        let sent = payload.clone();
        let writer = tokio::spawn(async move { w.write_all(&sent).await.unwrap() });
        let mut got = vec![0u8; payload.len()];
        r.read_exact(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, payload);

        let mut reply = eb.channel.replies_writer();
        reply.write_all(b"OK").await.unwrap();
        let mut ea = ea;
        let mut replies = ea.channel.take_replies_reader().unwrap();
        let mut ack = [0u8; 2];
        replies.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"OK");
    }

    #[tokio::test]
    async fn closing_one_side_ends_the_other() {
        let (a, _, _) = side("A", AuthPolicy::TrustOnFirstUse);
        let (b, _, _) = side("B", AuthPolicy::TrustOnFirstUse);
        let (sa, sb) = tokio::io::duplex(8 * 1024);
        let (ra, rb) = tokio::join!(a.negotiate(sa, true, None), b.negotiate(sb, false, None));
        let (ea, mut eb) = (ra.unwrap(), rb.unwrap());
        let mut frames = eb.channel.take_frames_reader().unwrap();
        ea.channel.close();
        tokio::time::timeout(Duration::from_secs(2), eb.channel.closed())
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(frames.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_sends_keepalives() {
        let (a, _, _) = side("A", AuthPolicy::TrustOnFirstUse);
        let (b, _, _) = side("B", AuthPolicy::TrustOnFirstUse);
        let (sa, sb) = tokio::io::duplex(8 * 1024);
        let (ra, rb) = tokio::join!(a.negotiate(sa, true, None), b.negotiate(sb, false, None));
        let (ea, eb) = (ra.unwrap(), rb.unwrap());
        let mut seen_by_b = eb.channel.activity();
        let mut seen_by_a = ea.channel.activity();
        seen_by_b.borrow_and_update();
        seen_by_a.borrow_and_update();

        tokio::time::timeout(KEEPALIVE_INTERVAL * 2, seen_by_b.changed())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(KEEPALIVE_INTERVAL * 2, seen_by_a.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!ea.channel.is_closed() && !eb.channel.is_closed());
    }

    #[tokio::test]
    async fn trusted_only_rejects_unknown() {
        let (a, _, _) = side("A", AuthPolicy::TrustOnFirstUse);
        let (b, _, cb) = side("B", AuthPolicy::TrustedOnly);
        let (sa, sb) = tokio::io::duplex(8 * 1024);
        let (ra, rb) = tokio::join!(a.negotiate(sa, true, None), b.negotiate(sb, false, None));
        assert!(matches!(ra, Err(SessionError::Untrusted(_))));
        assert!(matches!(rb, Err(SessionError::Untrusted(_))));
        assert!(!cb.lock().await.trust_store().is_trusted(&a.local_id()));
    }

    #[tokio::test]
    async fn advertised_key_mismatch_fails() {
        let (a, _, _) = side("A", AuthPolicy::TrustOnFirstUse);
        let (b, _, _) = side("B", AuthPolicy::TrustOnFirstUse);
        let impostor = Keypair::generate();
        let (sa, sb) = tokio::io::duplex(8 * 1024);
        let (ra, _rb) = tokio::join!(
            a.negotiate(sa, true, Some(impostor.public_key())),
            b.negotiate(sb, false, None)
        );
        assert!(matches!(ra, Err(SessionError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn pinned_key_mismatch_is_untrusted() {
        let (a, _, _) = side("A", AuthPolicy::TrustOnFirstUse);
        let (b, _, cb) = side("B", AuthPolicy::TrustOnFirstUse);
        let other = Keypair::generate();
        cb.lock().await.pin(TrustedPeer {
            device_id: a.local_id(),
            public_key: other.public_key().clone(),
            display_name: "A".into(),
            auth_mode: AuthMode::Verified,
        });
        let (sa, sb) = tokio::io::duplex(8 * 1024);
        let (ra, rb) = tokio::join!(a.negotiate(sa, true, None), b.negotiate(sb, false, None));
        assert!(matches!(rb, Err(SessionError::Untrusted(_))));
        assert!(matches!(ra, Err(SessionError::Untrusted(_))));
    }

    #[tokio::test]
    async fn prompt_accept_marks_verified() {
        let (tx, mut rx) = mpsc::channel(1);
        let (a, _, _) = side("A", AuthPolicy::TrustOnFirstUse);
        let (b, _, _) = side("B", AuthPolicy::Prompt(tx));
        let answer = tokio::spawn(async move {
            let prompt = rx.recv().await.unwrap();
            assert_eq!(prompt.display_name, "A");
            let code = prompt.code;
            prompt.accept();
            code
        });
        let (sa, sb) = tokio::io::duplex(8 * 1024);
        let (ra, rb) = tokio::join!(a.negotiate(sa, true, None), b.negotiate(sb, false, None));
        let eb = rb.unwrap();
        assert_eq!(eb.auth_mode, AuthMode::Verified);
        assert_eq!(ra.unwrap().code, answer.await.unwrap());
    }

    #[tokio::test]
    async fn prompt_reject_is_untrusted() {
        let (tx, mut rx) = mpsc::channel(1);
        let (a, _, _) = side("A", AuthPolicy::Prompt(tx));
        let (b, _, _) = side("B", AuthPolicy::TrustOnFirstUse);
        tokio::spawn(async move { rx.recv().await.unwrap().reject() });
        let (sa, sb) = tokio::io::duplex(8 * 1024);
        let (ra, rb) = tokio::join!(a.negotiate(sa, true, None), b.negotiate(sb, false, None));
        assert!(matches!(ra, Err(SessionError::Untrusted(_))));
        assert!(matches!(rb, Err(SessionError::Untrusted(_))));
    }

    #[tokio::test]
    async fn registry_keeps_one_session_under_races() {
        let me = Keypair::generate().device_id();
        let registry = Arc::new(SessionRegistry::new(me, Duration::ZERO));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let peer = Keypair::generate().device_id();
                let token = CancellationToken::new();
                registry.register(peer, true, token.clone()).unwrap();
                token
            }));
        }
        let mut tokens = Vec::new();
        for t in tasks {
            tokens.push(t.await.unwrap());
        }
        let live = tokens.iter().filter(|t| !t.is_cancelled()).count();
        assert_eq!(live, 1);
        let current = registry.current().unwrap();
        assert!(!current.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn crossed_connects_keep_smaller_dialer() {
        let me = Keypair::generate().device_id();
        let peer = Keypair::generate().device_id();
        let registry = SessionRegistry::new(me, Duration::from_secs(10));

        let first = CancellationToken::new();
        let ours = registry.register(peer, true, first.clone()).unwrap();
        let second = CancellationToken::new();
        let result = registry.register(peer, false, second.clone());

        if me < peer {
            // The session we dialed wins.
            assert!(matches!(result, Err(SessionError::Closed)));
            assert!(second.is_cancelled());
            assert_eq!(registry.current().unwrap().id, ours.id);
        } else {
            assert!(result.is_ok());
            assert!(first.is_cancelled());
            assert!(!registry.current().unwrap().initiator);
        }
    }

    #[tokio::test]
    async fn unregister_ignores_replaced_ids() {
        let me = Keypair::generate().device_id();
        let registry = SessionRegistry::new(me, Duration::ZERO);
        let a = registry
            .register(Keypair::generate().device_id(), true, CancellationToken::new())
            .unwrap();
        let b = registry
            .register(Keypair::generate().device_id(), true, CancellationToken::new())
            .unwrap();
        assert!(a.cancel.is_cancelled());
        assert!(!registry.unregister(a.id));
        assert!(registry.unregister(b.id));
        assert!(registry.current().is_none());
    }
}
