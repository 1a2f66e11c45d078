//! Liveness cache: heartbeat freshness per peer (fresh -> stale -> offline).
//!
//! Host-driven like the rest of the core: callers pass `now` in, so the
//! state machine is deterministic under test.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::identity::DeviceId;

/// Interval at which peers are expected to heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Silence longer than this demotes a peer to stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);
/// Silence longer than this (stale plus a 10 s grace window) marks a peer offline.
pub const DEFAULT_OFFLINE_AFTER: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    Fresh,
    Stale,
    Offline,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    pub stale_after: Duration,
    pub offline_after: Duration,
}

impl LivenessConfig {
    pub fn new(stale_after: Duration, offline_after: Duration) -> Self {
        Self {
            stale_after,
            offline_after: offline_after.max(stale_after),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER, DEFAULT_OFFLINE_AFTER)
    }
}

/// A state change observed by `record_heartbeat` or `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTransition {
    pub peer_id: DeviceId,
    pub from: Option<LivenessState>,
    pub to: LivenessState,
}

struct Entry {
    state: LivenessState,
    last_heartbeat: Instant,
}

pub struct LivenessCache {
    config: LivenessConfig,
    entries: HashMap<DeviceId, Entry>,
}

impl LivenessCache {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Record a heartbeat (or any other liveness signal). Returns the transition
    /// if the peer was unknown or not already fresh.
    pub fn record_heartbeat(&mut self, peer_id: DeviceId, now: Instant) -> Option<LivenessTransition> {
        match self.entries.get_mut(&peer_id) {
            Some(entry) => {
                entry.last_heartbeat = entry.last_heartbeat.max(now);
                let from = entry.state;
                entry.state = LivenessState::Fresh;
                (from != LivenessState::Fresh).then_some(LivenessTransition {
                    peer_id,
                    from: Some(from),
                    to: LivenessState::Fresh,
                })
            }
            None => {
                self.entries.insert(
                    peer_id,
                    Entry {
                        state: LivenessState::Fresh,
                        last_heartbeat: now,
                    },
                );
                Some(LivenessTransition {
                    peer_id,
                    from: None,
                    to: LivenessState::Fresh,
                })
            }
        }
    }

    /// Advance every peer to the state implied by its silence at `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<LivenessTransition> {
        let mut out = Vec::new();
        for (&peer_id, entry) in self.entries.iter_mut() {
            let silent = now.saturating_duration_since(entry.last_heartbeat);
            let next = if silent > self.config.offline_after {
                LivenessState::Offline
            } else if silent > self.config.stale_after {
                LivenessState::Stale
            } else {
                LivenessState::Fresh
            };
            // Only heartbeats promote; ticks only demote.
            if rank(next) > rank(entry.state) {
                out.push(LivenessTransition {
                    peer_id,
                    from: Some(entry.state),
                    to: next,
                });
                entry.state = next;
            }
        }
        out
    }

    /// Force a peer offline (graceful leave).
    pub fn mark_offline(&mut self, peer_id: DeviceId) -> Option<LivenessTransition> {
        let entry = self.entries.get_mut(&peer_id)?;
        let from = entry.state;
        entry.state = LivenessState::Offline;
        (from != LivenessState::Offline).then_some(LivenessTransition {
            peer_id,
            from: Some(from),
            to: LivenessState::Offline,
        })
    }

    pub fn get(&self, peer_id: &DeviceId) -> Option<LivenessState> {
        self.entries.get(peer_id).map(|e| e.state)
    }

    pub fn last_heartbeat(&self, peer_id: &DeviceId) -> Option<Instant> {
        self.entries.get(peer_id).map(|e| e.last_heartbeat)
    }

    pub fn forget(&mut self, peer_id: &DeviceId) {
        self.entries.remove(peer_id);
    }
}

impl Default for LivenessCache {
    fn default() -> Self {
        Self::new(LivenessConfig::default())
    }
}

fn rank(state: LivenessState) -> u8 {
    match state {
        LivenessState::Fresh => 0,
        LivenessState::Stale => 1,
        LivenessState::Offline => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn first_heartbeat_is_fresh() {
        let mut cache = LivenessCache::default();
        let peer = Keypair::generate().device_id();
        let t0 = Instant::now();
        let tr = cache.record_heartbeat(peer, t0).unwrap();
        assert_eq!(tr.from, None);
        assert_eq!(cache.get(&peer), Some(LivenessState::Fresh));
        assert!(cache.record_heartbeat(peer, t0 + secs(1.0)).is_none());
    }

    #[test]
    fn regular_heartbeats_stay_fresh() {
        let mut cache = LivenessCache::default();
        let peer = Keypair::generate().device_id();
        let t0 = Instant::now();
        cache.record_heartbeat(peer, t0);
        for i in 1..=20u32 {
            let at = t0 + secs(5.0) * i;
            assert!(cache.tick(at).is_empty(), "tick {i}");
            cache.record_heartbeat(peer, at);
            assert_eq!(cache.get(&peer), Some(LivenessState::Fresh));
        }
    }

    #[test]
    fn desk_a_goes_stale_then_offline() {
        let mut cache = LivenessCache::default();
        let desk_a = Keypair::generate().device_id();
        let t0 = Instant::now();
        cache.record_heartbeat(desk_a, t0);

        let tr = cache.tick(t0 + secs(5.1));
        assert_eq!(tr.len(), 1);
        assert_eq!(cache.get(&desk_a), Some(LivenessState::Stale));

        cache.tick(t0 + secs(10.0));
        assert_eq!(cache.get(&desk_a), Some(LivenessState::Stale));

        let tr = cache.tick(t0 + secs(16.0));
        assert_eq!(tr[0].to, LivenessState::Offline);
        assert_eq!(cache.get(&desk_a), Some(LivenessState::Offline));
    }

    #[test]
    fn heartbeat_while_stale_resets_to_fresh() {
        let mut cache = LivenessCache::default();
        let peer = Keypair::generate().device_id();
        let t0 = Instant::now();
        cache.record_heartbeat(peer, t0);
        cache.tick(t0 + secs(6.0));
        let tr = cache.record_heartbeat(peer, t0 + secs(7.0)).unwrap();
        assert_eq!(tr.from, Some(LivenessState::Stale));
        assert_eq!(cache.get(&peer), Some(LivenessState::Fresh));
        assert!(cache.tick(t0 + secs(11.0)).is_empty());
    }

    #[test]
    fn rediscovery_after_offline() {
        let mut cache = LivenessCache::default();
        let peer = Keypair::generate().device_id();
        let t0 = Instant::now();
        cache.record_heartbeat(peer, t0);
        let tr = cache.tick(t0 + secs(30.0));
        assert_eq!(tr[0].from, Some(LivenessState::Fresh));
        assert_eq!(tr[0].to, LivenessState::Offline);
        let tr = cache.record_heartbeat(peer, t0 + secs(31.0)).unwrap();
        assert_eq!(tr.from, Some(LivenessState::Offline));
        assert_eq!(cache.get(&peer), Some(LivenessState::Fresh));
    }

    #[test]
    fn leave_marks_offline() {
        let mut cache = LivenessCache::default();
        let peer = Keypair::generate().device_id();
        cache.record_heartbeat(peer, Instant::now());
        assert!(cache.mark_offline(peer).is_some());
        assert!(cache.mark_offline(peer).is_none());
        assert_eq!(cache.get(&peer), Some(LivenessState::Offline));
    }

    #[test]
    fn offline_never_below_stale_threshold() {
        let config = LivenessConfig::new(secs(8.0), secs(2.0));
        assert_eq!(config.offline_after, secs(8.0));
    }
}
