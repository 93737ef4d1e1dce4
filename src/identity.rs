//! Persistent local identity
//!
//! A secp256k1 key pair stored as an `nsec` file. This is the "social"
//! identity that survives restarts; it is announced to the relay with
//! `registerPublicKey` but never used as a transport session identifier.

use anyhow::{Context, Result};
use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::{Keys, PublicKey, SecretKey};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct LocalIdentity {
    keys: Keys,
    path: PathBuf,
}

impl LocalIdentity {
    /// Load the identity at `path`, generating and persisting one on first use.
    /// Returns the identity and whether it was just created.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<(Self, bool)> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::load(path)?, false))
        } else {
            Ok((Self::create(path)?, true))
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let nsec = fs::read_to_string(path).context("Failed to read nsec file")?;
        let secret_key = SecretKey::from_bech32(nsec.trim()).context("Invalid nsec format")?;
        Ok(Self {
            keys: Keys::new(secret_key),
            path: path.to_path_buf(),
        })
    }

    /// Generate a fresh key pair and write it to `path` (mode 0600)
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let keys = Keys::generate();
        let nsec = keys
            .secret_key()
            .to_bech32()
            .context("Failed to encode nsec")?;
        fs::write(path, &nsec).context("Failed to write nsec file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        info!("Generated new identity at {}", path.display());
        Ok(Self {
            keys,
            path: path.to_path_buf(),
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Hex public key, as announced to the rendezvous relay
    pub fn public_key_hex(&self) -> String {
        self.keys.public_key().to_hex()
    }

    pub fn npub(&self) -> Result<String> {
        self.keys
            .public_key()
            .to_bech32()
            .context("Failed to encode npub")
    }
}

/// Accepts `npub1...` or 64-char hex
pub fn parse_public_key(key: &str) -> Result<PublicKey> {
    let key = key.trim();
    if key.starts_with("npub1") {
        PublicKey::from_bech32(key).context("Invalid npub format")
    } else {
        PublicKey::from_hex(key).context("Invalid public key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_is_created_once() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("keys").join("nsec");

        let (first, created) = LocalIdentity::load_or_create(&path)?;
        assert!(created);
        assert!(path.exists());

        let (second, created) = LocalIdentity::load_or_create(&path)?;
        assert!(!created);
        assert_eq!(first.public_key(), second.public_key());
        assert!(first.npub()?.starts_with("npub1"));
        assert_eq!(first.public_key_hex().len(), 64);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }

    #[test]
    fn test_corrupt_nsec_is_an_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nsec");
        fs::write(&path, "not-a-key")?;
        assert!(LocalIdentity::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_public_key_accepts_npub_and_hex() -> Result<()> {
        let keys = Keys::generate();
        let npub = keys.public_key().to_bech32()?;
        assert_eq!(parse_public_key(&npub)?, keys.public_key());
        assert_eq!(parse_public_key(&keys.public_key().to_hex())?, keys.public_key());
        assert!(parse_public_key("npub1garbage").is_err());
        Ok(())
    }
}
