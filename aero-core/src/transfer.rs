//! Transfer jobs and their state machine.
//!
//! `queued -> active -> completed`, `active <-> paused`, `active -> failed`.
//! Activation is gated solely by session availability; the queue never does I/O.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::identity::DeviceId;
use crate::protocol::FileMeta;
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Why a job failed, in words a user can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum FailureReason {
    #[error("disk error: {0}")]
    Disk(String),
    #[error("checksum mismatch, partial file kept")]
    ChecksumMismatch,
    #[error("receiver rejected the file")]
    Rejected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transfer ended early: {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },
    #[error("cancelled")]
    Cancelled,
}

/// What to move: a local source (outgoing) or an expected arrival (incoming).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Name carried on the wire.
    pub name: String,
    /// Source file (outgoing) or destination file (incoming).
    pub path: PathBuf,
    /// Total size; 0 when unknown for an incoming job.
    pub size: u64,
}

impl FileDescriptor {
    /// Descriptor for a local file, named by its last path component.
    pub fn for_path(path: impl Into<PathBuf>, size: u64) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?.to_string();
        Some(Self { name, path, size })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferJob {
    pub id: JobId,
    pub peer_id: DeviceId,
    pub file_name: String,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub direction: Direction,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Outgoing: whether the receiver's ack was seen before completion.
    pub ack_observed: bool,
    /// Incoming: a partial `.part` file was left on disk.
    pub incomplete: bool,
    pub speed_bps: u64,
    pub path: PathBuf,
    /// Sender's job id for incoming jobs, used to match resume probes.
    #[serde(skip)]
    pub remote_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("no job {0}")]
    NotFound(JobId),
    #[error("job {0} is already {1:?}")]
    Terminal(JobId, JobState),
    #[error("job {id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceId),
    #[error(transparent)]
    BadName(#[from] wire::MetaError),
}

/// All jobs, in enqueue order.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<TransferJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. Starts `active` when a session to the peer is live, else `queued`.
    pub fn enqueue(
        &mut self,
        peer_id: DeviceId,
        file: FileDescriptor,
        direction: Direction,
        session_live: bool,
    ) -> Result<TransferJob, JobError> {
        wire::validate_name(&file.name)?;
        let job = TransferJob {
            id: JobId::new(),
            peer_id,
            file_name: file.name,
            total_bytes: file.size,
            bytes_transferred: 0,
            direction,
            state: if session_live {
                JobState::Active
            } else {
                JobState::Queued
            },
            checksum: None,
            failure: None,
            ack_observed: false,
            incomplete: false,
            speed_bps: 0,
            path: file.path,
            remote_id: None,
        };
        tracing::debug!(job_id = %job.id, peer_id = %peer_id, state = ?job.state, "job enqueued");
        self.jobs.push(job.clone());
        Ok(job)
    }

    /// Session to `peer_id` is up: queued and paused jobs become active, offsets kept.
    pub fn on_session_established(&mut self, peer_id: DeviceId) -> Vec<TransferJob> {
        self.transition_all(peer_id, &[JobState::Queued, JobState::Paused], JobState::Active)
    }

    /// Session to `peer_id` is gone: active jobs pause where they are.
    pub fn on_session_lost(&mut self, peer_id: DeviceId) -> Vec<TransferJob> {
        self.transition_all(peer_id, &[JobState::Active], JobState::Paused)
    }

    fn transition_all(
        &mut self,
        peer_id: DeviceId,
        from: &[JobState],
        to: JobState,
    ) -> Vec<TransferJob> {
        let mut changed = Vec::new();
        for job in self
            .jobs
            .iter_mut()
            .filter(|j| j.peer_id == peer_id && from.contains(&j.state))
        {
            job.state = to;
            job.speed_bps = 0;
            changed.push(job.clone());
        }
        changed
    }

    /// Record bytes moved. The count never goes backwards here; see `rebase`.
    pub fn progress(
        &mut self,
        id: JobId,
        bytes_transferred: u64,
        speed_bps: Option<u64>,
    ) -> Result<TransferJob, JobError> {
        // A chunk already on disk when the session dropped still counts.
        let job = self.non_terminal_mut(id)?;
        if job.state == JobState::Queued {
            return Err(JobError::InvalidTransition {
                id,
                from: job.state,
                to: JobState::Active,
            });
        }
        job.bytes_transferred = job.bytes_transferred.max(bytes_transferred);
        if let (JobState::Active, Some(bps)) = (job.state, speed_bps) {
            job.speed_bps = bps;
        }
        Ok(job.clone())
    }

    /// Move the resume point to an offset the peer confirmed. May lower the count.
    pub fn rebase(&mut self, id: JobId, offset: u64) -> Result<TransferJob, JobError> {
        let job = self.non_terminal_mut(id)?;
        if offset != job.bytes_transferred {
            tracing::info!(
                job_id = %id,
                from = job.bytes_transferred,
                to = offset,
                "resume offset rewritten to confirmed length"
            );
            job.bytes_transferred = offset;
        }
        Ok(job.clone())
    }

    /// Fill in what an incoming frame tells us about the file.
    pub fn describe_incoming(
        &mut self,
        id: JobId,
        total_bytes: u64,
        checksum: Option<String>,
        remote_id: Option<String>,
    ) -> Result<TransferJob, JobError> {
        let job = self.non_terminal_mut(id)?;
        job.total_bytes = total_bytes;
        if checksum.is_some() {
            job.checksum = checksum;
        }
        if remote_id.is_some() {
            job.remote_id = remote_id;
        }
        Ok(job.clone())
    }

    pub fn set_checksum(&mut self, id: JobId, checksum: String) -> Result<TransferJob, JobError> {
        let job = self.non_terminal_mut(id)?;
        job.checksum = Some(checksum);
        Ok(job.clone())
    }

    /// Where an incoming file finally landed.
    pub fn set_path(&mut self, id: JobId, path: PathBuf) -> Result<TransferJob, JobError> {
        let job = self.non_terminal_mut(id)?;
        job.path = path;
        Ok(job.clone())
    }

    pub fn complete(&mut self, id: JobId, ack_observed: bool) -> Result<TransferJob, JobError> {
        let job = self.active_mut(id)?;
        job.state = JobState::Completed;
        job.bytes_transferred = job.total_bytes;
        job.ack_observed = ack_observed;
        job.incomplete = false;
        job.speed_bps = 0;
        Ok(job.clone())
    }

    pub fn fail(&mut self, id: JobId, reason: FailureReason) -> Result<TransferJob, JobError> {
        let job = self.non_terminal_mut(id)?;
        tracing::warn!(job_id = %id, reason = %reason, "job failed");
        job.state = JobState::Failed;
        job.incomplete = job.direction == Direction::Incoming && job.bytes_transferred > 0;
        job.failure = Some(reason);
        job.speed_bps = 0;
        Ok(job.clone())
    }

    /// Remove a non-terminal job. Returns it as it was just before removal.
    pub fn cancel(&mut self, id: JobId) -> Result<TransferJob, JobError> {
        let idx = self.index(id)?;
        let state = self.jobs[idx].state;
        if state.is_terminal() {
            return Err(JobError::Terminal(id, state));
        }
        Ok(self.jobs.remove(idx))
    }

    /// First active outgoing job for the peer, in enqueue order.
    pub fn next_outgoing(&self, peer_id: DeviceId) -> Option<&TransferJob> {
        self.jobs.iter().find(|j| {
            j.peer_id == peer_id && j.direction == Direction::Outgoing && j.state == JobState::Active
        })
    }

    /// Bind an arriving frame to an incoming job: first by the sender's job id (resume),
    /// then by an expected file name, else a new job saving into `download_dir`.
    /// Returns the job and whether it was newly created.
    pub fn bind_incoming(
        &mut self,
        peer_id: DeviceId,
        meta: &FileMeta,
        download_dir: &Path,
    ) -> Result<(TransferJob, bool), JobError> {
        let candidates = |j: &&TransferJob| {
            j.peer_id == peer_id && j.direction == Direction::Incoming && !j.state.is_terminal()
        };
        let by_remote = meta.id.as_ref().and_then(|rid| {
            self.jobs
                .iter()
                .filter(candidates)
                .find(|j| j.remote_id.as_deref() == Some(rid.as_str()))
        });
        let by_name = || {
            self.jobs
                .iter()
                .filter(candidates)
                .find(|j| j.remote_id.is_none() && j.file_name == meta.name)
        };
        if let Some(job) = by_remote.or_else(by_name) {
            let id = job.id;
            let job = self.describe_incoming(id, meta.total(), meta.sha256.clone(), meta.id.clone())?;
            return Ok((job, false));
        }

        let file = FileDescriptor {
            name: meta.name.clone(),
            path: download_dir.join(&meta.name),
            size: meta.total(),
        };
        let mut job = self.enqueue(peer_id, file, Direction::Incoming, true)?;
        job = self.describe_incoming(job.id, meta.total(), meta.sha256.clone(), meta.id.clone())?;
        Ok((job, true))
    }

    /// Any non-terminal job still needs this peer.
    pub fn references(&self, peer_id: &DeviceId) -> bool {
        self.jobs
            .iter()
            .any(|j| j.peer_id == *peer_id && !j.state.is_terminal())
    }

    /// Outgoing work waiting for a session to the peer.
    pub fn has_pending_outgoing(&self, peer_id: &DeviceId) -> bool {
        self.jobs.iter().any(|j| {
            j.peer_id == *peer_id
                && j.direction == Direction::Outgoing
                && matches!(j.state, JobState::Queued | JobState::Paused)
        })
    }

    pub fn get(&self, id: JobId) -> Option<&TransferJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn list(&self) -> Vec<TransferJob> {
        self.jobs.clone()
    }

    fn index(&self, id: JobId) -> Result<usize, JobError> {
        self.jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or(JobError::NotFound(id))
    }

    fn non_terminal_mut(&mut self, id: JobId) -> Result<&mut TransferJob, JobError> {
        let idx = self.index(id)?;
        let job = &mut self.jobs[idx];
        if job.state.is_terminal() {
            return Err(JobError::Terminal(id, job.state));
        }
        Ok(job)
    }

    fn active_mut(&mut self, id: JobId) -> Result<&mut TransferJob, JobError> {
        let job = self.non_terminal_mut(id)?;
        if job.state != JobState::Active {
            return Err(JobError::InvalidTransition {
                id,
                from: job.state,
                to: JobState::Active,
            });
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkSizer;
    use crate::identity::Keypair;
    use std::time::Duration;

    fn peer() -> DeviceId {
        Keypair::generate().device_id()
    }

    fn file(name: &str, size: u64) -> FileDescriptor {
        FileDescriptor {
            name: name.to_string(),
            path: PathBuf::from("/tmp").join(name),
            size,
        }
    }

    #[test]
    fn enqueue_without_session_is_queued() {
        let mut q = JobQueue::new();
        let p = peer();
        let job = q.enqueue(p, file("a.bin", 10), Direction::Outgoing, false).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(q.next_outgoing(p).is_none());
        assert!(q.has_pending_outgoing(&p));
    }

    #[test]
    fn enqueue_with_session_is_active() {
        let mut q = JobQueue::new();
        let p = peer();
        let job = q.enqueue(p, file("a.bin", 10), Direction::Outgoing, true).unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(q.next_outgoing(p).unwrap().id, job.id);
    }

    #[test]
    fn bad_name_rejected() {
        let mut q = JobQueue::new();
        assert!(matches!(
            q.enqueue(peer(), file("../x", 1), Direction::Outgoing, true),
            Err(JobError::BadName(_))
        ));
    }

    #[test]
    fn queued_job_activates_from_offset_zero() {
        let mut q = JobQueue::new();
        let p = peer();
        let job = q.enqueue(p, file("j.bin", 1000), Direction::Outgoing, false).unwrap();
        let changed = q.on_session_established(p);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, job.id);
        assert_eq!(changed[0].state, JobState::Active);
        assert_eq!(changed[0].bytes_transferred, 0);
    }

    #[test]
    fn session_events_only_touch_that_peer() {
        let mut q = JobQueue::new();
        let (a, b) = (peer(), peer());
        q.enqueue(a, file("a", 1), Direction::Outgoing, true).unwrap();
        q.enqueue(b, file("b", 1), Direction::Outgoing, true).unwrap();
        let paused = q.on_session_lost(a);
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].peer_id, a);
        assert!(q.next_outgoing(b).is_some());
    }

    #[test]
    fn late_progress_after_pause_is_kept() {
        let mut q = JobQueue::new();
        let p = peer();
        let id = q.enqueue(p, file("late.bin", 1000), Direction::Incoming, true).unwrap().id;
        q.progress(id, 400, Some(1000)).unwrap();
        q.on_session_lost(p);

        let job = q.progress(id, 600, Some(5000)).unwrap();
        assert_eq!(job.state, JobState::Paused);
        assert_eq!(job.bytes_transferred, 600);
        assert_eq!(job.speed_bps, 0);

        let queued = q.enqueue(p, file("later.bin", 10), Direction::Outgoing, false).unwrap();
        assert!(q.progress(queued.id, 5, None).is_err());
    }

    #[test]
    fn ten_mib_disconnect_at_four_mib_then_resume() {
        const TOTAL: u64 = 10_485_760;
        const CUT: u64 = 4_194_304;
        let mut q = JobQueue::new();
        let p = peer();
        let id = q
            .enqueue(p, file("video.mp4", TOTAL), Direction::Outgoing, true)
            .unwrap()
            .id;

        let mut sizer = ChunkSizer::new();
        let mut sent = 0u64;
        while sent < CUT {
            let n = (sizer.next_size() as u64).min(CUT - sent);
            sent += n;
            q.progress(id, sent, None).unwrap();
            sizer.record(n as usize, Duration::from_millis(100));
        }

        q.on_session_lost(p);
        let job = q.get(id).unwrap();
        assert_eq!(job.state, JobState::Paused);
        assert_eq!(job.bytes_transferred, 4_194_304);

        let resumed = q.on_session_established(p);
        assert_eq!(resumed[0].bytes_transferred, CUT);
        while sent < TOTAL {
            let n = (sizer.next_size() as u64).min(TOTAL - sent);
            sent += n;
            let job = q.progress(id, sent, None).unwrap();
            assert!(job.bytes_transferred >= CUT);
        }
        let done = q.complete(id, true).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.bytes_transferred, 10_485_760);
    }

    #[test]
    fn progress_never_decreases_but_rebase_can() {
        let mut q = JobQueue::new();
        let p = peer();
        let id = q.enqueue(p, file("a", 100), Direction::Outgoing, true).unwrap().id;
        q.progress(id, 60, None).unwrap();
        assert_eq!(q.progress(id, 40, None).unwrap().bytes_transferred, 60);
        assert_eq!(q.rebase(id, 50).unwrap().bytes_transferred, 50);
    }

    #[test]
    fn fail_is_terminal() {
        let mut q = JobQueue::new();
        let p = peer();
        let id = q.enqueue(p, file("a", 100), Direction::Incoming, true).unwrap().id;
        q.progress(id, 10, None).unwrap();
        let job = q.fail(id, FailureReason::ChecksumMismatch).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.incomplete);
        assert!(q.on_session_established(p).is_empty());
        assert!(matches!(q.cancel(id), Err(JobError::Terminal(..))));
        assert!(!q.references(&p));
    }

    #[test]
    fn cancel_removes() {
        let mut q = JobQueue::new();
        let p = peer();
        let id = q.enqueue(p, file("a", 100), Direction::Outgoing, false).unwrap().id;
        let removed = q.cancel(id).unwrap();
        assert_eq!(removed.state, JobState::Queued);
        assert!(q.get(id).is_none());
        assert!(matches!(q.cancel(id), Err(JobError::NotFound(_))));
    }

    #[test]
    fn bind_expected_then_resume_by_remote_id() {
        let mut q = JobQueue::new();
        let p = peer();
        let expected = q
            .enqueue(p, file("report.pdf", 0), Direction::Incoming, true)
            .unwrap();
        let meta = FileMeta {
            id: Some("remote-1".into()),
            total: Some(500),
            ..FileMeta::new("report.pdf", 500)
        };
        let (job, created) = q.bind_incoming(p, &meta, Path::new("/dl")).unwrap();
        assert!(!created);
        assert_eq!(job.id, expected.id);
        assert_eq!(job.total_bytes, 500);
        assert_eq!(job.path, PathBuf::from("/tmp/report.pdf"));

        let probe = FileMeta::resume_probe("report.pdf", "remote-1", 500);
        let (again, created) = q.bind_incoming(p, &probe, Path::new("/dl")).unwrap();
        assert!(!created);
        assert_eq!(again.id, expected.id);
    }

    #[test]
    fn unsolicited_frame_creates_job_in_download_dir() {
        let mut q = JobQueue::new();
        let p = peer();
        let (job, created) = q
            .bind_incoming(p, &FileMeta::new("photo.jpg", 42), Path::new("/dl"))
            .unwrap();
        assert!(created);
        assert_eq!(job.direction, Direction::Incoming);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.path, PathBuf::from("/dl/photo.jpg"));
        assert_eq!(job.total_bytes, 42);
    }

    #[test]
    fn descriptor_from_path() {
        let d = FileDescriptor::for_path("/home/u/notes.txt", 3).unwrap();
        assert_eq!(d.name, "notes.txt");
        assert!(FileDescriptor::for_path("/", 0).is_none());
    }
}
