//! On-disk identity and trusted peers under `state_dir`.
//!
//! `identity.key` holds the 32 raw secret bytes (mode 0600 on unix);
//! `trusted.toml` holds the pinned peers as `[[peer]]` tables.

use std::io::Write;
use std::path::{Path, PathBuf};

use aero_core::{Keypair, TrustStore};
use anyhow::{bail, Context, Result};
use tokio::fs;
use tracing::{info, warn};

const IDENTITY_FILE: &str = "identity.key";
const TRUST_FILE: &str = "trusted.toml";

#[derive(Debug, Clone)]
pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the device identity, generating and saving one on first run.
    pub async fn load_or_create_identity(&self) -> Result<Keypair> {
        let path = self.dir.join(IDENTITY_FILE);
        match fs::read(&path).await {
            Ok(bytes) => {
                let Ok(secret) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                    bail!(
                        "{} is {} bytes, expected 32",
                        path.display(),
                        bytes.len()
                    );
                };
                let kp = Keypair::from_secret_bytes(secret);
                info!(device_id = %kp.device_id(), "loaded device identity");
                Ok(kp)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let kp = Keypair::generate();
                fs::create_dir_all(&self.dir)
                    .await
                    .context("failed to create state directory")?;
                write_secret(path.clone(), kp.secret_bytes()).await?;
                info!(device_id = %kp.device_id(), path = %path.display(), "generated and saved new device identity");
                Ok(kp)
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Pinned peers; an absent file is an empty store.
    pub async fn load_trust(&self) -> Result<TrustStore> {
        let path = self.dir.join(TRUST_FILE);
        let text = match fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TrustStore::new()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let parsed: TrustStore =
            toml::from_str(&text).with_context(|| format!("invalid {}", path.display()))?;
        let store = TrustStore::from_peers(
            parsed
                .peers()
                .iter()
                .filter(|p| {
                    let ok = p.device_id.matches(&p.public_key);
                    if !ok {
                        warn!(device_id = %p.device_id, "dropping pinned peer whose key does not match its id");
                    }
                    ok
                })
                .cloned()
                .collect(),
        );
        info!(pinned = store.peers().len(), "loaded trusted peers");
        Ok(store)
    }

    /// Write the store atomically (temp file + rename).
    pub async fn save_trust(&self, store: &TrustStore) -> Result<()> {
        let text = toml::to_string(store).context("failed to encode trusted peers")?;
        fs::create_dir_all(&self.dir)
            .await
            .context("failed to create state directory")?;
        let path = self.dir.join(TRUST_FILE);
        let tmp = self.dir.join(format!("{TRUST_FILE}.tmp"));
        fs::write(&tmp, text)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

async fn write_secret(path: PathBuf, secret: [u8; 32]) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(&secret).context("failed to write key")?;
        file.flush().context("failed to flush key file")?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("key write task failed")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_core::{AuthMode, TrustedPeer};

    #[tokio::test]
    async fn identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::new(dir.path().join("state"));
        let first = ks.load_or_create_identity().await.unwrap();
        let second = ks.load_or_create_identity().await.unwrap();
        assert_eq!(first.device_id(), second.device_id());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn identity_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::new(dir.path());
        ks.load_or_create_identity().await.unwrap();
        let meta = std::fs::metadata(dir.path().join(IDENTITY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn truncated_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), [1u8; 10]).unwrap();
        assert!(Keystore::new(dir.path()).load_or_create_identity().await.is_err());
    }

    #[tokio::test]
    async fn trust_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::new(dir.path());
        assert!(ks.load_trust().await.unwrap().peers().is_empty());

        let kp = Keypair::generate();
        let mut store = TrustStore::new();
        store.pin(TrustedPeer {
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            display_name: "Galaxy S24".into(),
            auth_mode: AuthMode::Verified,
        });
        ks.save_trust(&store).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join(TRUST_FILE)).unwrap();
        assert!(text.contains("[[peer]]"));
        assert!(text.contains(&kp.device_id().to_string()));

        let loaded = ks.load_trust().await.unwrap();
        assert!(loaded.is_trusted(&kp.device_id()));
        assert_eq!(loaded.get(&kp.device_id()).unwrap().auth_mode, AuthMode::Verified);
    }
}
