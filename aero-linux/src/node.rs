//! The node: wires discovery, the coordinator, sessions and the transfer
//! engine together and exposes the API a UI drives.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aero_core::{
    Action, Coordinator, DeviceId, Direction, Event, FileDescriptor, JobError, JobId, Keypair,
    Peer, PeerAdvertisement, PublicKey, TransferJob,
};
use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AuthPolicyKind, Config};
use crate::discovery::{Advertiser, Discovery, Intervals, SelfDescriptor, Sighting};
use crate::engine::{Engine, EngineConfig};
use crate::keystore::Keystore;
use crate::session::{
    AuthPolicy, AuthPrompt, Established, LocalIdentity, Negotiator, NegotiatorConfig,
    SessionError, SessionHandle, SessionRegistry,
};

const EVENT_CAPACITY: usize = 256;
const PROMPT_CAPACITY: usize = 8;
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Session traffic is reported to the coordinator at most this often.
const ACTIVITY_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    keypair: Arc<Keypair>,
    coordinator: Arc<Mutex<Coordinator>>,
    keystore: Keystore,
    negotiator: Negotiator,
    registry: SessionRegistry,
    engine: Engine,
    events: broadcast::Sender<Event>,
    actions: mpsc::UnboundedSender<Action>,
    prompts: std::sync::Mutex<Option<mpsc::Receiver<AuthPrompt>>>,
    advertiser: Mutex<Option<Advertiser>>,
    listen_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Node {
    /// Load identity and trust, bind sockets and start all background tasks.
    pub async fn start(config: Config) -> anyhow::Result<Node> {
        let keystore = Keystore::new(&config.state_dir);
        let keypair = Arc::new(keystore.load_or_create_identity().await?);
        let trust = keystore.load_trust().await?;
        let device_id = keypair.device_id();
        tokio::fs::create_dir_all(&config.download_dir)
            .await
            .with_context(|| format!("failed to create {}", config.download_dir.display()))?;

        let listener = TcpListener::bind(("0.0.0.0", config.transport_port))
            .await
            .with_context(|| format!("failed to bind transport port {}", config.transport_port))?;
        let listen_addr = listener.local_addr()?;

        let coordinator = Arc::new(Mutex::new(Coordinator::new(
            device_id,
            config.coordinator(),
            trust,
        )));
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (policy, prompts) = match config.auth_policy {
            AuthPolicyKind::Tofu => (AuthPolicy::TrustOnFirstUse, None),
            AuthPolicyKind::TrustedOnly => (AuthPolicy::TrustedOnly, None),
            AuthPolicyKind::Prompt => {
                let (tx, rx) = mpsc::channel(PROMPT_CAPACITY);
                (AuthPolicy::Prompt(tx), Some(rx))
            }
        };
        let negotiator = Negotiator::new(
            LocalIdentity {
                keypair: keypair.clone(),
                display_name: config.display_name.clone(),
                device_class: config.device_class,
            },
            coordinator.clone(),
            policy,
            NegotiatorConfig {
                connect_timeout: config.connect_timeout(),
                handshake_timeout: config.handshake_timeout(),
                auth_prompt_timeout: config.auth_prompt_timeout(),
                keepalive_interval: config.heartbeat_interval(),
            },
        );
        let engine = Engine::new(
            coordinator.clone(),
            actions_tx.clone(),
            EngineConfig {
                verify_checksums: config.verify_checksums,
                ack_timeout: config.ack_timeout(),
            },
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            keypair: keypair.clone(),
            coordinator,
            keystore,
            negotiator,
            registry: SessionRegistry::new(device_id, config.handshake_timeout()),
            engine,
            events,
            actions: actions_tx,
            prompts: std::sync::Mutex::new(prompts),
            advertiser: Mutex::new(None),
            listen_addr,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(inner.clone().run_actions(actions_rx));
        tokio::spawn(inner.clone().run_ticker());
        tokio::spawn(inner.clone().run_accept(listener));

        // Port 0 turns LAN discovery off; peers can still be added by hand.
        if config.discovery_port != 0 {
            match Discovery::bind(config.discovery_port, device_id).await {
                Ok(discovery) => {
                    let mut me = SelfDescriptor::new(
                        &keypair,
                        config.display_name.clone(),
                        config.device_class,
                        listen_addr.port(),
                    );
                    me.host = config.advertise_host.clone();
                    let intervals = Intervals {
                        announce: config.announce_interval(),
                        heartbeat: config.heartbeat_interval(),
                    };
                    match discovery.start_advertising(me, intervals) {
                        Ok(adv) => *inner.advertiser.lock().await = Some(adv),
                        Err(e) => warn!(error = %e, "cannot advertise on the LAN"),
                    }
                    tokio::spawn(inner.clone().run_browser(discovery));
                }
                Err(e) => warn!(
                    port = config.discovery_port,
                    error = %e,
                    "LAN discovery unavailable, only known peers are reachable"
                ),
            }
        }

        info!(
            device_id = %device_id,
            name = %config.display_name,
            addr = %listen_addr,
            "node started"
        );
        Ok(Node { inner })
    }

    pub fn local_id(&self) -> DeviceId {
        self.inner.keypair.device_id()
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keypair.public_key().clone()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    pub async fn list_peers(&self) -> Vec<Peer> {
        self.inner.coordinator.lock().await.list_peers()
    }

    /// By display name (case-insensitive) or device id prefix.
    pub async fn find_peer(&self, query: &str) -> Option<Peer> {
        self.inner.coordinator.lock().await.find_peer(query)
    }

    /// Feed an advertisement that did not come from multicast discovery.
    pub async fn add_peer(&self, adv: PeerAdvertisement) {
        let actions = self
            .inner
            .coordinator
            .lock()
            .await
            .on_advertisement(adv, Instant::now());
        self.inner.dispatch(actions);
    }

    /// Open a session to a known peer, replacing any other session.
    pub async fn connect(&self, peer_id: DeviceId) -> Result<(), SessionError> {
        self.inner.connect(peer_id).await
    }

    /// Close the session to the peer. Its active jobs pause.
    pub fn disconnect(&self, peer_id: DeviceId) -> bool {
        self.inner.registry.close(peer_id)
    }

    pub async fn enqueue_transfer(
        &self,
        peer_id: DeviceId,
        file: FileDescriptor,
        direction: Direction,
    ) -> Result<JobId, JobError> {
        let (id, actions) = self
            .inner
            .coordinator
            .lock()
            .await
            .enqueue(peer_id, file, direction)?;
        self.inner.dispatch(actions);
        Ok(id)
    }

    /// Queue a local file for sending.
    pub async fn enqueue_file(&self, peer_id: DeviceId, path: &Path) -> anyhow::Result<JobId> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        if !meta.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let file = FileDescriptor::for_path(path, meta.len())
            .with_context(|| format!("{} has no usable file name", path.display()))?;
        Ok(self.enqueue_transfer(peer_id, file, Direction::Outgoing).await?)
    }

    pub async fn cancel_transfer(&self, job_id: JobId) -> Result<(), JobError> {
        let actions = self.inner.coordinator.lock().await.cancel(job_id)?;
        self.inner.dispatch(actions);
        Ok(())
    }

    pub async fn jobs(&self) -> Vec<TransferJob> {
        self.inner.coordinator.lock().await.jobs()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Verification requests under the `prompt` policy. Can be taken once.
    pub fn auth_prompts(&self) -> Option<mpsc::Receiver<AuthPrompt>> {
        self.inner.prompts.lock().ok().and_then(|mut p| p.take())
    }

    /// Announce departure, close the session and stop background tasks.
    pub async fn shutdown(&self) {
        if let Some(adv) = self.inner.advertiser.lock().await.take() {
            adv.stop().await;
        }
        self.inner.registry.close_all();
        self.inner.shutdown.cancel();
        info!("node stopped");
    }
}

impl Inner {
    fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            let _ = self.actions.send(action);
        }
    }

    async fn run_actions(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Action>) {
        loop {
            let action = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                a = rx.recv() => match a {
                    Some(a) => a,
                    None => break,
                },
            };
            match action {
                Action::Notify(event) => {
                    let _ = self.events.send(event);
                }
                Action::JobsReady(peer_id) => self.registry.wake(peer_id),
                Action::AbortJob { job_id, .. } => {
                    self.engine.abort(job_id);
                }
                Action::CloseSession(peer_id) => {
                    self.registry.close(peer_id);
                }
                Action::Reconnect(peer_id) => {
                    let inner = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.connect(peer_id).await {
                            info!(peer_id = %peer_id, error = %e, "reconnect failed");
                        }
                    });
                }
            }
        }
    }

    async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let actions = self.coordinator.lock().await.tick(Instant::now());
                    self.dispatch(actions);
                }
            }
        }
    }

    async fn run_browser(self: Arc<Self>, discovery: Discovery) {
        let mut browser = discovery.start_browsing();
        loop {
            let sighting = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                s = browser.next() => match s {
                    Some(s) => s,
                    None => break,
                },
            };
            let now = Instant::now();
            let actions = {
                let mut c = self.coordinator.lock().await;
                match sighting {
                    Sighting::Advertisement(adv) => c.on_advertisement(adv, now),
                    Sighting::Heartbeat(id) => c.on_heartbeat(id, now),
                    Sighting::Departure(id) => c.on_leave(id, now),
                }
            };
            self.dispatch(actions);
        }
        browser.stop().await;
    }

    async fn run_accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = listener.accept() => r,
            };
            let (stream, addr) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let inner = self.clone();
            tokio::spawn(async move {
                match inner.negotiator.accept(stream).await {
                    Ok(established) => {
                        if let Err(e) = inner.install(established).await {
                            debug!(%addr, error = %e, "inbound session not kept");
                        }
                    }
                    Err(e) => warn!(%addr, error = %e, "inbound handshake failed"),
                }
            });
        }
    }

    async fn connect(self: &Arc<Self>, peer_id: DeviceId) -> Result<(), SessionError> {
        let _serial = self.registry.lock_connect().await;
        if self.registry.live_for(peer_id).is_some() {
            return Ok(());
        }
        let peer = self.coordinator.lock().await.peer(&peer_id);
        let Some(peer) = peer else {
            return Err(SessionError::Unreachable(io::Error::new(
                io::ErrorKind::NotFound,
                format!("peer {peer_id} has not been discovered"),
            )));
        };
        let established = match self.negotiator.connect(&peer).await {
            Ok(e) => e,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "connect failed");
                return Err(e);
            }
        };
        self.install(established).await
    }

    /// Register a finished handshake as the live session and start its workers.
    async fn install(self: &Arc<Self>, mut est: Established) -> Result<(), SessionError> {
        self.dispatch(std::mem::take(&mut est.actions));
        if est.pinned {
            let store = self.coordinator.lock().await.trust_store().clone();
            if let Err(e) = self.keystore.save_trust(&store).await {
                warn!(error = %e, "failed to save trusted peers");
            }
        }

        // Registry and coordinator change together so both see sessions in the same order.
        let handle = {
            let mut c = self.coordinator.lock().await;
            let handle = self
                .registry
                .register(est.peer_id, est.initiator, est.channel.token())?;
            let actions =
                c.on_session_established(est.peer_id, handle.id, est.auth_mode, Instant::now());
            self.dispatch(actions);
            handle
        };
        self.engine.spawn_session_workers(&handle, &mut est.channel);
        info!(
            peer_id = %est.peer_id,
            name = %est.peer_name,
            session_id = handle.id,
            code = %est.code,
            "session open"
        );
        tokio::spawn(self.clone().watch_session(handle, est.channel.activity()));
        Ok(())
    }

    /// Feed session traffic to liveness, then clean up once the session ends.
    async fn watch_session(
        self: Arc<Self>,
        handle: SessionHandle,
        mut activity: watch::Receiver<()>,
    ) {
        let mut reported = Instant::now();
        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => break,
                changed = activity.changed() => {
                    if changed.is_err() {
                        handle.cancel.cancelled().await;
                        break;
                    }
                }
            }
            let now = Instant::now();
            if now.duration_since(reported) < ACTIVITY_REPORT_INTERVAL {
                continue;
            }
            reported = now;
            let actions = self
                .coordinator
                .lock()
                .await
                .on_session_activity(handle.peer_id, handle.id, now);
            self.dispatch(actions);
        }
        self.registry.unregister(handle.id);
        let actions = self
            .coordinator
            .lock()
            .await
            .on_session_closed(handle.peer_id, handle.id);
        self.dispatch(actions);
    }
}
