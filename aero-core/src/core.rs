//! Host-driven API: the Coordinator receives events from the host and returns actions.
//!
//! It owns the peer table, the job queue and the trust store, and knows which
//! peer (if any) currently has a session. It never does I/O: the host runs the
//! sockets and disk, reports what happened, and carries out the returned actions.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::identity::{DeviceId, PublicKey};
use crate::liveness::{LivenessConfig, LivenessState, LivenessTransition};
use crate::peers::{Peer, PeerAdvertisement, PeerTable, TrustState};
use crate::protocol::FileMeta;
use crate::transfer::{
    Direction, FailureReason, FileDescriptor, JobError, JobId, JobQueue, JobState, TransferJob,
};
use crate::trust::{AuthMode, TrustCheck, TrustStore, TrustedPeer};

/// Default time an offline, unreferenced peer stays listed.
pub const DEFAULT_PRUNE_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub liveness: LivenessConfig,
    pub prune_after: Duration,
    pub auto_reconnect: bool,
    /// Where unsolicited incoming files land.
    pub download_dir: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            prune_after: DEFAULT_PRUNE_AFTER,
            auto_reconnect: true,
            download_dir: PathBuf::from("."),
        }
    }
}

/// State change for subscribers (the UI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    PeerChanged(Peer),
    PeerRemoved { peer_id: DeviceId },
    JobChanged(TransferJob),
    SessionOpened { peer_id: DeviceId, auth_mode: AuthMode },
    SessionClosed { peer_id: DeviceId },
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Publish to subscribers.
    Notify(Event),
    /// Active outgoing jobs are waiting on the peer's session.
    JobsReady(DeviceId),
    /// Stop the I/O of a job that is no longer in the queue.
    AbortJob { job_id: JobId, peer_id: DeviceId, direction: Direction },
    /// Tear down the session to the peer.
    CloseSession(DeviceId),
    /// Try once to open a session to the peer.
    Reconnect(DeviceId),
}

#[derive(Debug, Clone, Copy)]
struct LiveSession {
    peer_id: DeviceId,
    session_id: u64,
    auth_mode: AuthMode,
    established_at: Instant,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct Coordinator {
    self_id: DeviceId,
    config: CoordinatorConfig,
    peers: PeerTable,
    jobs: JobQueue,
    trust: TrustStore,
    session: Option<LiveSession>,
}

impl Coordinator {
    pub fn new(self_id: DeviceId, config: CoordinatorConfig, trust: TrustStore) -> Self {
        Self {
            self_id,
            peers: PeerTable::new(config.liveness),
            jobs: JobQueue::new(),
            trust,
            session: None,
            config,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.self_id
    }

    // --- discovery and liveness ---

    /// A resolved advertisement arrived. Counts as a heartbeat.
    pub fn on_advertisement(&mut self, adv: PeerAdvertisement, now: Instant) -> Vec<Action> {
        if adv.device_id == self.self_id {
            return Vec::new();
        }
        let id = adv.device_id;
        let trust_state = match self.trust.check(&id, &adv.public_key) {
            TrustCheck::Trusted(_) => TrustState::Trusted,
            TrustCheck::Unknown | TrustCheck::KeyMismatch => TrustState::Unknown,
        };
        let transition = self.peers.upsert(adv, trust_state, now);
        let mut actions = self.peer_changed(&id);
        if let Some(tr) = transition {
            actions.extend(self.on_transition(tr));
        }
        actions
    }

    pub fn on_heartbeat(&mut self, peer_id: DeviceId, now: Instant) -> Vec<Action> {
        match self.peers.heartbeat(peer_id, now) {
            Some(tr) => {
                let mut actions = self.peer_changed(&peer_id);
                actions.extend(self.on_transition(tr));
                actions
            }
            None => Vec::new(),
        }
    }

    /// The peer announced it is leaving.
    pub fn on_leave(&mut self, peer_id: DeviceId, now: Instant) -> Vec<Action> {
        match self.peers.leave(peer_id, now) {
            Some(tr) => {
                let mut actions = self.peer_changed(&peer_id);
                actions.extend(self.on_transition(tr));
                actions
            }
            None => Vec::new(),
        }
    }

    /// Periodic tick: liveness demotions and pruning of long-gone peers.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for tr in self.peers.tick(now) {
            actions.extend(self.peer_changed(&tr.peer_id));
            actions.extend(self.on_transition(tr));
        }
        let jobs = &self.jobs;
        let session_peer = self.session.map(|s| s.peer_id);
        let pruned = self.peers.prune(now, self.config.prune_after, |id| {
            jobs.references(id) || session_peer == Some(*id)
        });
        for peer_id in pruned {
            tracing::debug!(peer_id = %peer_id, "pruned offline peer");
            actions.push(Action::Notify(Event::PeerRemoved { peer_id }));
        }
        actions
    }

    fn on_transition(&mut self, tr: LivenessTransition) -> Vec<Action> {
        let mut actions = Vec::new();
        match tr.to {
            LivenessState::Offline => {
                tracing::info!(peer_id = %tr.peer_id, "peer offline");
                if self.session_peer() == Some(tr.peer_id) {
                    actions.push(Action::CloseSession(tr.peer_id));
                    if let Some(s) = self.session.take() {
                        actions.extend(self.session_lost(s));
                    }
                }
            }
            LivenessState::Fresh => {
                let rediscovered = matches!(tr.from, None | Some(LivenessState::Offline));
                if rediscovered
                    && self.config.auto_reconnect
                    && self.session_peer() != Some(tr.peer_id)
                    && self.jobs.has_pending_outgoing(&tr.peer_id)
                {
                    tracing::info!(peer_id = %tr.peer_id, "peer back with pending jobs, reconnecting");
                    actions.push(Action::Reconnect(tr.peer_id));
                }
            }
            LivenessState::Stale => {
                tracing::debug!(peer_id = %tr.peer_id, "peer stale");
            }
        }
        actions
    }

    fn peer_changed(&self, peer_id: &DeviceId) -> Vec<Action> {
        self.peers
            .get(peer_id)
            .map(|p| Action::Notify(Event::PeerChanged(p)))
            .into_iter()
            .collect()
    }

    // --- trust ---

    pub fn trust_check(&self, peer_id: &DeviceId, public_key: &PublicKey) -> TrustCheck {
        self.trust.check(peer_id, public_key)
    }

    /// Pin a peer after a successful authentication decision.
    pub fn pin(&mut self, peer: TrustedPeer) -> Vec<Action> {
        let id = peer.device_id;
        self.trust.pin(peer);
        if self.peers.set_trust(&id, TrustState::Trusted) {
            self.peer_changed(&id)
        } else {
            Vec::new()
        }
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    // --- sessions ---

    /// Session `session_id` to the peer completed its handshake.
    pub fn on_session_established(
        &mut self,
        peer_id: DeviceId,
        session_id: u64,
        auth_mode: AuthMode,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(prev) = self.session.take() {
            actions.extend(self.session_lost(prev));
        }
        self.session = Some(LiveSession {
            peer_id,
            session_id,
            auth_mode,
            established_at: now,
        });
        tracing::info!(peer_id = %peer_id, session_id, ?auth_mode, "session established");
        actions.push(Action::Notify(Event::SessionOpened { peer_id, auth_mode }));
        for job in self.jobs.on_session_established(peer_id) {
            actions.push(Action::Notify(Event::JobChanged(job)));
        }
        if self.jobs.next_outgoing(peer_id).is_some() {
            actions.push(Action::JobsReady(peer_id));
        }
        actions
    }

    /// Records arrived on session `session_id`. The authenticated traffic
    /// counts as a heartbeat for its peer.
    pub fn on_session_activity(
        &mut self,
        peer_id: DeviceId,
        session_id: u64,
        now: Instant,
    ) -> Vec<Action> {
        match self.session {
            Some(s) if s.peer_id == peer_id && s.session_id == session_id => self.on_heartbeat(peer_id, now),
            _ => Vec::new(),
        }
    }

    /// Session `session_id` closed. Stale ids (already replaced) are ignored.
    pub fn on_session_closed(&mut self, peer_id: DeviceId, session_id: u64) -> Vec<Action> {
        match self.session {
            Some(s) if s.peer_id == peer_id && s.session_id == session_id => {
                self.session = None;
                self.session_lost(s)
            }
            _ => Vec::new(),
        }
    }

    fn session_lost(&mut self, s: LiveSession) -> Vec<Action> {
        tracing::info!(
            peer_id = %s.peer_id,
            session_id = s.session_id,
            lasted_ms = s.established_at.elapsed().as_millis() as u64,
            "session closed"
        );
        let mut actions = vec![Action::Notify(Event::SessionClosed { peer_id: s.peer_id })];
        for job in self.jobs.on_session_lost(s.peer_id) {
            actions.push(Action::Notify(Event::JobChanged(job)));
        }
        actions
    }

    pub fn session_peer(&self) -> Option<DeviceId> {
        self.session.map(|s| s.peer_id)
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.map(|s| s.session_id)
    }

    pub fn session_auth_mode(&self) -> Option<AuthMode> {
        self.session.map(|s| s.auth_mode)
    }

    // --- jobs ---

    pub fn enqueue(
        &mut self,
        peer_id: DeviceId,
        file: FileDescriptor,
        direction: Direction,
    ) -> Result<(JobId, Vec<Action>), JobError> {
        if self.peers.get(&peer_id).is_none() && !self.trust.is_trusted(&peer_id) {
            return Err(JobError::UnknownPeer(peer_id));
        }
        let live = self.session_peer() == Some(peer_id);
        let job = self.jobs.enqueue(peer_id, file, direction, live)?;
        let id = job.id;
        let mut actions = vec![Action::Notify(Event::JobChanged(job))];
        if live && direction == Direction::Outgoing {
            actions.push(Action::JobsReady(peer_id));
        }
        Ok((id, actions))
    }

    /// Remove a non-terminal job. Subscribers see a final `failed/cancelled` snapshot.
    pub fn cancel(&mut self, job_id: JobId) -> Result<Vec<Action>, JobError> {
        let mut job = self.jobs.cancel(job_id)?;
        let was_active = job.state == JobState::Active;
        tracing::info!(job_id = %job_id, peer_id = %job.peer_id, was_active, "job cancelled");

        let mut actions = Vec::new();
        if was_active {
            actions.push(Action::AbortJob {
                job_id,
                peer_id: job.peer_id,
                direction: job.direction,
            });
            // A payload region cannot be interrupted in-band.
            if job.direction == Direction::Outgoing {
                actions.push(Action::CloseSession(job.peer_id));
            }
        }
        job.incomplete = job.direction == Direction::Incoming && job.bytes_transferred > 0;
        job.state = JobState::Failed;
        job.failure = Some(FailureReason::Cancelled);
        job.speed_bps = 0;
        actions.push(Action::Notify(Event::JobChanged(job)));
        Ok(actions)
    }

    pub fn next_outgoing(&self, peer_id: DeviceId) -> Option<TransferJob> {
        self.jobs.next_outgoing(peer_id).cloned()
    }

    pub fn job(&self, job_id: JobId) -> Option<TransferJob> {
        self.jobs.get(job_id).cloned()
    }

    /// Whether the job is still active (not paused, cancelled or finished).
    pub fn is_active(&self, job_id: JobId) -> bool {
        self.jobs
            .get(job_id)
            .is_some_and(|j| j.state == JobState::Active)
    }

    pub fn jobs(&self) -> Vec<TransferJob> {
        self.jobs.list()
    }

    pub fn progress(
        &mut self,
        job_id: JobId,
        bytes_transferred: u64,
        speed_bps: Option<u64>,
    ) -> Result<Vec<Action>, JobError> {
        let job = self.jobs.progress(job_id, bytes_transferred, speed_bps)?;
        Ok(vec![Action::Notify(Event::JobChanged(job))])
    }

    pub fn rebase(&mut self, job_id: JobId, offset: u64) -> Result<Vec<Action>, JobError> {
        let job = self.jobs.rebase(job_id, offset)?;
        Ok(vec![Action::Notify(Event::JobChanged(job))])
    }

    pub fn set_checksum(&mut self, job_id: JobId, checksum: String) -> Result<(), JobError> {
        self.jobs.set_checksum(job_id, checksum).map(|_| ())
    }

    pub fn set_path(&mut self, job_id: JobId, path: PathBuf) -> Result<(), JobError> {
        self.jobs.set_path(job_id, path).map(|_| ())
    }

    pub fn complete(&mut self, job_id: JobId, ack_observed: bool) -> Result<Vec<Action>, JobError> {
        let job = self.jobs.complete(job_id, ack_observed)?;
        tracing::info!(
            job_id = %job_id,
            peer_id = %job.peer_id,
            bytes = job.total_bytes,
            ack_observed,
            "job completed"
        );
        Ok(vec![Action::Notify(Event::JobChanged(job))])
    }

    pub fn fail(&mut self, job_id: JobId, reason: FailureReason) -> Result<Vec<Action>, JobError> {
        let job = self.jobs.fail(job_id, reason)?;
        Ok(vec![Action::Notify(Event::JobChanged(job))])
    }

    /// Bind an arriving frame from the session peer to an incoming job.
    pub fn bind_incoming(
        &mut self,
        peer_id: DeviceId,
        meta: &FileMeta,
    ) -> Result<(TransferJob, Vec<Action>), JobError> {
        let download_dir: &Path = &self.config.download_dir;
        let (job, created) = self.jobs.bind_incoming(peer_id, meta, download_dir)?;
        if created {
            tracing::info!(job_id = %job.id, peer_id = %peer_id, name = %job.file_name, "incoming file");
        }
        let actions = vec![Action::Notify(Event::JobChanged(job.clone()))];
        Ok((job, actions))
    }

    // --- peers ---

    pub fn list_peers(&self) -> Vec<Peer> {
        self.peers.list()
    }

    pub fn peer(&self, peer_id: &DeviceId) -> Option<Peer> {
        self.peers.get(peer_id)
    }

    pub fn find_peer(&self, query: &str) -> Option<Peer> {
        self.peers.find(query)
    }
}
