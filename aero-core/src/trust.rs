//! Trust store: peers whose public key has been pinned, and how they were authenticated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, PublicKey};

/// How a session's peer was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Accepted automatically on first contact and pinned.
    TrustOnFirstUse,
    /// A user compared the verification code on both devices.
    Verified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedPeer {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub display_name: String,
    pub auth_mode: AuthMode,
}

/// Result of looking a peer up before a session is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustCheck {
    Trusted(AuthMode),
    Unknown,
    /// Same device ID pinned with another key. Never admitted.
    KeyMismatch,
}

/// Pinned peers. Serialized as `[[peer]]` tables by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustStore {
    #[serde(default, rename = "peer")]
    peers: Vec<TrustedPeer>,
    #[serde(skip)]
    index: BTreeMap<DeviceId, usize>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the lookup index after deserializing.
    pub fn from_peers(peers: Vec<TrustedPeer>) -> Self {
        let mut store = Self::new();
        for peer in peers {
            store.pin(peer);
        }
        store
    }

    pub fn check(&self, device_id: &DeviceId, public_key: &PublicKey) -> TrustCheck {
        match self.get(device_id) {
            Some(p) if &p.public_key == public_key => TrustCheck::Trusted(p.auth_mode),
            Some(_) => TrustCheck::KeyMismatch,
            None => TrustCheck::Unknown,
        }
    }

    pub fn is_trusted(&self, device_id: &DeviceId) -> bool {
        self.index.contains_key(device_id)
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&TrustedPeer> {
        self.index.get(device_id).map(|&i| &self.peers[i])
    }

    /// Pin a peer, replacing any previous entry for the same device ID.
    pub fn pin(&mut self, peer: TrustedPeer) {
        match self.index.get(&peer.device_id) {
            Some(&i) => self.peers[i] = peer,
            None => {
                self.index.insert(peer.device_id, self.peers.len());
                self.peers.push(peer);
            }
        }
    }

    pub fn forget(&mut self, device_id: &DeviceId) -> Option<TrustedPeer> {
        let i = self.index.remove(device_id)?;
        let removed = self.peers.remove(i);
        self.reindex();
        Some(removed)
    }

    pub fn peers(&self) -> &[TrustedPeer] {
        &self.peers
    }

    /// Call after deserializing; `index` is not persisted.
    pub fn reindex(&mut self) {
        self.index = self
            .peers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.device_id, i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn trusted(kp: &Keypair, mode: AuthMode) -> TrustedPeer {
        TrustedPeer {
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            display_name: "Pixel 8 Pro".to_string(),
            auth_mode: mode,
        }
    }

    #[test]
    fn unknown_then_pinned() {
        let kp = Keypair::generate();
        let mut store = TrustStore::new();
        assert_eq!(
            store.check(&kp.device_id(), kp.public_key()),
            TrustCheck::Unknown
        );
        store.pin(trusted(&kp, AuthMode::TrustOnFirstUse));
        assert_eq!(
            store.check(&kp.device_id(), kp.public_key()),
            TrustCheck::Trusted(AuthMode::TrustOnFirstUse)
        );
    }

    #[test]
    fn pinned_key_mismatch() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let store = TrustStore::from_peers(vec![trusted(&kp, AuthMode::Verified)]);
        assert_eq!(
            store.check(&kp.device_id(), other.public_key()),
            TrustCheck::KeyMismatch
        );
    }

    #[test]
    fn repin_replaces_mode() {
        let kp = Keypair::generate();
        let mut store = TrustStore::new();
        store.pin(trusted(&kp, AuthMode::TrustOnFirstUse));
        store.pin(trusted(&kp, AuthMode::Verified));
        assert_eq!(store.peers().len(), 1);
        assert_eq!(store.get(&kp.device_id()).unwrap().auth_mode, AuthMode::Verified);
    }

    #[test]
    fn forget_keeps_index_consistent() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut store = TrustStore::new();
        store.pin(trusted(&a, AuthMode::Verified));
        store.pin(trusted(&b, AuthMode::Verified));
        assert!(store.forget(&a.device_id()).is_some());
        assert!(!store.is_trusted(&a.device_id()));
        assert_eq!(store.get(&b.device_id()).unwrap().device_id, b.device_id());
    }

    #[test]
    fn serde_roundtrip_needs_reindex() {
        let kp = Keypair::generate();
        let store = TrustStore::from_peers(vec![trusted(&kp, AuthMode::Verified)]);
        let json = serde_json::to_string(&store).unwrap();
        let mut back: TrustStore = serde_json::from_str(&json).unwrap();
        back.reindex();
        assert!(back.is_trusted(&kp.device_id()));
    }
}
