//! Peer table: every device seen on the LAN, its address, trust and liveness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::identity::{DeviceId, PublicKey};
use crate::liveness::{LivenessCache, LivenessConfig, LivenessState, LivenessTransition};
use crate::protocol::DeviceClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustState {
    Unknown,
    Trusted,
}

/// A resolved announcement: everything needed to dial a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAdvertisement {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub fingerprint: String,
    pub address: SocketAddr,
}

/// Read-only snapshot handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub id: DeviceId,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub address: SocketAddr,
    #[serde(skip)]
    pub public_key: PublicKey,
    pub fingerprint: String,
    pub trust_state: TrustState,
    pub liveness: LivenessState,
    #[serde(skip)]
    pub last_heartbeat_at: Instant,
}

struct Record {
    advertisement: PeerAdvertisement,
    trust_state: TrustState,
    offline_since: Option<Instant>,
}

pub struct PeerTable {
    records: HashMap<DeviceId, Record>,
    liveness: LivenessCache,
}

impl PeerTable {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            records: HashMap::new(),
            liveness: LivenessCache::new(config),
        }
    }

    /// Insert or refresh a peer from an advertisement. Counts as a heartbeat.
    /// Returns the liveness transition if there was one.
    pub fn upsert(
        &mut self,
        advertisement: PeerAdvertisement,
        trust_state: TrustState,
        now: Instant,
    ) -> Option<LivenessTransition> {
        let id = advertisement.device_id;
        self.records
            .entry(id)
            .and_modify(|r| {
                r.advertisement = advertisement.clone();
                r.trust_state = trust_state;
                r.offline_since = None;
            })
            .or_insert(Record {
                advertisement,
                trust_state,
                offline_since: None,
            });
        self.liveness.record_heartbeat(id, now)
    }

    /// Heartbeat from a peer. Ignored (returns `None`) for peers never advertised,
    /// since there is no address to reach them at.
    pub fn heartbeat(&mut self, peer_id: DeviceId, now: Instant) -> Option<LivenessTransition> {
        let record = self.records.get_mut(&peer_id)?;
        record.offline_since = None;
        self.liveness.record_heartbeat(peer_id, now)
    }

    /// Graceful leave: mark offline immediately.
    pub fn leave(&mut self, peer_id: DeviceId, now: Instant) -> Option<LivenessTransition> {
        let record = self.records.get_mut(&peer_id)?;
        let tr = self.liveness.mark_offline(peer_id);
        if tr.is_some() {
            record.offline_since = Some(now);
        }
        tr
    }

    pub fn tick(&mut self, now: Instant) -> Vec<LivenessTransition> {
        let transitions = self.liveness.tick(now);
        for tr in &transitions {
            if tr.to == LivenessState::Offline {
                if let Some(r) = self.records.get_mut(&tr.peer_id) {
                    r.offline_since = Some(now);
                }
            }
        }
        transitions
    }

    /// Drop peers offline for longer than `after`, unless `referenced` says a job still needs them.
    pub fn prune(
        &mut self,
        now: Instant,
        after: Duration,
        referenced: impl Fn(&DeviceId) -> bool,
    ) -> Vec<DeviceId> {
        let expired: Vec<DeviceId> = self
            .records
            .iter()
            .filter(|(id, r)| {
                r.offline_since
                    .is_some_and(|t| now.saturating_duration_since(t) >= after)
                    && !referenced(id)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.records.remove(id);
            self.liveness.forget(id);
        }
        expired
    }

    pub fn set_trust(&mut self, peer_id: &DeviceId, trust_state: TrustState) -> bool {
        match self.records.get_mut(peer_id) {
            Some(r) if r.trust_state != trust_state => {
                r.trust_state = trust_state;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, peer_id: &DeviceId) -> Option<Peer> {
        self.records.get(peer_id).map(|r| self.snapshot(r))
    }

    pub fn liveness(&self, peer_id: &DeviceId) -> Option<LivenessState> {
        self.liveness.get(peer_id)
    }

    /// All peers, most recently heard first.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.records.values().map(|r| self.snapshot(r)).collect();
        peers.sort_by(|a, b| b.last_heartbeat_at.cmp(&a.last_heartbeat_at));
        peers
    }

    /// Find a peer by exact display name (case-insensitive) or device ID prefix.
    pub fn find(&self, query: &str) -> Option<Peer> {
        let q = query.to_ascii_lowercase();
        self.records
            .values()
            .find(|r| {
                r.advertisement.display_name.to_ascii_lowercase() == q
                    || r.advertisement.device_id.to_string().starts_with(&q)
            })
            .map(|r| self.snapshot(r))
    }

    fn snapshot(&self, r: &Record) -> Peer {
        let id = r.advertisement.device_id;
        Peer {
            id,
            display_name: r.advertisement.display_name.clone(),
            device_class: r.advertisement.device_class,
            address: r.advertisement.address,
            public_key: r.advertisement.public_key.clone(),
            fingerprint: r.advertisement.fingerprint.clone(),
            trust_state: r.trust_state,
            liveness: self.liveness.get(&id).unwrap_or(LivenessState::Offline),
            last_heartbeat_at: self
                .liveness
                .last_heartbeat(&id)
                .unwrap_or_else(Instant::now),
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new(LivenessConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    pub(crate) fn advertisement(kp: &Keypair, name: &str) -> PeerAdvertisement {
        PeerAdvertisement {
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            display_name: name.to_string(),
            device_class: DeviceClass::Desktop,
            fingerprint: kp.public_key().fingerprint(),
            address: "192.168.1.110:45679".parse().unwrap(),
        }
    }

    #[test]
    fn upsert_creates_then_updates() {
        let mut table = PeerTable::default();
        let kp = Keypair::generate();
        let t0 = Instant::now();
        assert!(table
            .upsert(advertisement(&kp, "ThinkPad"), TrustState::Unknown, t0)
            .is_some());
        let mut moved = advertisement(&kp, "ThinkPad X1");
        moved.address = "192.168.1.111:45679".parse().unwrap();
        assert!(table
            .upsert(moved, TrustState::Trusted, t0 + Duration::from_secs(1))
            .is_none());
        let peer = table.get(&kp.device_id()).unwrap();
        assert_eq!(peer.display_name, "ThinkPad X1");
        assert_eq!(peer.address.port(), 45679);
        assert_eq!(peer.trust_state, TrustState::Trusted);
        assert_eq!(table.list().len(), 1);
    }

    #[test]
    fn heartbeat_from_unknown_peer_ignored() {
        let mut table = PeerTable::default();
        let kp = Keypair::generate();
        assert!(table.heartbeat(kp.device_id(), Instant::now()).is_none());
        assert!(table.get(&kp.device_id()).is_none());
    }

    #[test]
    fn offline_peer_kept_while_referenced() {
        let mut table = PeerTable::default();
        let kp = Keypair::generate();
        let t0 = Instant::now();
        table.upsert(advertisement(&kp, "Galaxy Tab"), TrustState::Unknown, t0);
        table.tick(t0 + Duration::from_secs(20));
        assert_eq!(
            table.liveness(&kp.device_id()),
            Some(LivenessState::Offline)
        );

        let later = t0 + Duration::from_secs(200);
        assert!(table
            .prune(later, Duration::from_secs(60), |_| true)
            .is_empty());
        assert!(table.get(&kp.device_id()).is_some());

        let pruned = table.prune(later, Duration::from_secs(60), |_| false);
        assert_eq!(pruned, vec![kp.device_id()]);
        assert!(table.get(&kp.device_id()).is_none());
    }

    #[test]
    fn leave_then_rediscover() {
        let mut table = PeerTable::default();
        let kp = Keypair::generate();
        let t0 = Instant::now();
        table.upsert(advertisement(&kp, "MacBook Air"), TrustState::Unknown, t0);
        let tr = table.leave(kp.device_id(), t0).unwrap();
        assert_eq!(tr.to, LivenessState::Offline);
        let tr = table
            .upsert(advertisement(&kp, "MacBook Air"), TrustState::Unknown, t0)
            .unwrap();
        assert_eq!(tr.from, Some(LivenessState::Offline));
        assert_eq!(tr.to, LivenessState::Fresh);
    }

    #[test]
    fn find_by_name_or_prefix() {
        let mut table = PeerTable::default();
        let kp = Keypair::generate();
        table.upsert(advertisement(&kp, "DeskA"), TrustState::Unknown, Instant::now());
        assert!(table.find("deska").is_some());
        assert!(table.find(&kp.device_id().short()).is_some());
        assert!(table.find("nobody").is_none());
    }
}
