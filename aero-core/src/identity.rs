//! Device identity and crypto: keypairs, device ID, fingerprints, session keys, wire encryption.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Device public key (32 bytes, X25519). Serializable for announcements and handshake.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "fixed_bytes")] [u8; 32]);

/// Fixed-size byte arrays: hex in human-readable formats (TOML, JSON), raw bytes otherwise (bincode).
mod fixed_bytes {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<const N: usize, S: Serializer>(
        v: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            hex::encode(v).serialize(serializer)
        } else {
            v.as_slice().serialize(serializer)
        }
    }

    pub fn deserialize<'de, const N: usize, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let buf: Vec<u8> = if d.is_human_readable() {
            let s = String::deserialize(d)?;
            hex::decode(s).map_err(de::Error::custom)?
        } else {
            Deserialize::deserialize(d)?
        };
        buf.try_into()
            .map_err(|_| de::Error::custom(format!("expected {} bytes", N)))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Partial fingerprint advertised on the LAN for out-of-band comparison,
    /// e.g. `3f:a1:09:7c:de:00:12:b4`.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        digest[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Device ID: deterministic hash of public key. Used in discovery and peer list.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DeviceId(#[serde(with = "fixed_bytes")] [u8; 16]);

impl DeviceId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive device ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        DeviceId(id)
    }

    /// Whether this ID was derived from `public`.
    pub fn matches(&self, public: &PublicKey) -> bool {
        *self == Self::from_public_key(public.as_bytes())
    }

    /// First 8 hex characters, for log lines and prefix lookups.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short())
    }
}

impl FromStr for DeviceId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; 16];
        hex::decode_to_slice(s, &mut id)?;
        Ok(DeviceId(id))
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and device ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    device_id: DeviceId,
}

impl Keypair {
    /// Generate a new random keypair and derive device ID from public key.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from persisted secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public_x = X25519PublicKey::from(&secret);
        let public = PublicKey(public_x.to_bytes());
        let device_id = DeviceId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            device_id,
        }
    }

    /// Raw secret bytes, for persisting the identity.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Shared secret with another device's public key. Input to the session key schedule.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Random 32-byte handshake nonce.
pub fn handshake_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Directional keys for one session, plus the short authentication string.
pub struct SessionKeys {
    /// Key for records this side writes.
    pub send: [u8; 32],
    /// Key for records this side reads.
    pub recv: [u8; 32],
    code: VerificationCode,
}

/// Inputs from both `Hello` messages, ordered by role (initiator first).
pub struct Transcript<'a> {
    pub initiator_public: &'a PublicKey,
    pub responder_public: &'a PublicKey,
    pub initiator_nonce: &'a [u8; 32],
    pub responder_nonce: &'a [u8; 32],
}

impl SessionKeys {
    /// Derive both directions from the static DH secret and the handshake transcript.
    /// Both sides get the same pair with `send`/`recv` swapped.
    pub fn derive(shared_secret: &[u8; 32], transcript: &Transcript<'_>, initiator: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"aerosync-session-v1");
        hasher.update(shared_secret);
        hasher.update(transcript.initiator_nonce);
        hasher.update(transcript.responder_nonce);
        hasher.update(transcript.initiator_public.as_bytes());
        hasher.update(transcript.responder_public.as_bytes());
        let master: [u8; 32] = hasher.finalize().into();

        let i2r = expand(&master, b"i2r");
        let r2i = expand(&master, b"r2i");
        let code = VerificationCode::from_master(&master);
        if initiator {
            Self {
                send: i2r,
                recv: r2i,
                code,
            }
        } else {
            Self {
                send: r2i,
                recv: i2r,
                code,
            }
        }
    }

    /// Code both users compare when verifying a new peer out of band.
    pub fn verification_code(&self) -> VerificationCode {
        self.code
    }
}

fn expand(master: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master);
    hasher.update(label);
    hasher.finalize().into()
}

/// Six-digit short authentication string, shown as `123 456`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerificationCode(u32);

impl VerificationCode {
    fn from_master(master: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"aerosync-sas");
        hasher.update(master);
        let digest = hasher.finalize();
        let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        VerificationCode(n % 1_000_000)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VerificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {:03}", self.0 / 1000, self.0 % 1000)
    }
}

/// Wire encryption: ChaCha20-Poly1305. Nonce: 96-bit counter per direction; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&nonce.to_le_bytes());
    nonce_bytes
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
