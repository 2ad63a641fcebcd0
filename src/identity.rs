//! Peer identities
//!
//! A peer is identified by its X25519 public key. The keypair is created once
//! per installation and kept in a base64 private key file.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Length of a public key in bytes
pub const KEY_LEN: usize = 32;

/// Length of a relay node identifier in bytes
pub const NODE_ID_LEN: usize = 16;

/// A peer's public key, the primary key of the registry
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; KEY_LEN]);

impl Identity {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse a base64 (44 chars) or hex (64 chars) encoded key
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(Error::InvalidIdentity("identity is empty".into()));
        }

        let bytes = if s.len() == KEY_LEN * 2 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            hex::decode(s).map_err(|e| Error::InvalidIdentity(format!("bad hex: {}", e)))?
        } else {
            BASE64
                .decode(s)
                .map_err(|e| Error::InvalidIdentity(format!("bad base64: {}", e)))?
        };

        let arr: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidIdentity(format!(
                "key is {} bytes (expected {})",
                bytes.len(),
                KEY_LEN
            ))
        })?;
        Ok(Self(arr))
    }

    /// Base64 form, as understood by the tunnel engine
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Relay identifier derived from this key
    pub fn node_id(&self) -> NodeId {
        let hash = Sha256::digest(self.0);
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&hash[..NODE_ID_LEN]);
        NodeId(id)
    }

    /// Shortened form for log lines
    pub fn short(&self) -> String {
        let full = self.to_base64();
        format!("{}…", &full[..8])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_base64())
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Identity::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl From<PublicKey> for Identity {
    fn from(key: PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

/// 16-byte identifier used on the relay wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// X25519 keypair for this installation
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load a keypair from a private key file (32 bytes, base64 encoded)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_base64(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("private key {:?}: {}", path, msg)),
            other => other,
        })
    }

    /// Parse a base64 private key, as written by `save` or `wg genkey`
    pub fn from_base64(input: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(input.trim())
            .map_err(|e| Error::Config(format!("invalid base64: {}", e)))?;
        let key_bytes: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::Config(format!("key is {} bytes (expected {})", bytes.len(), KEY_LEN))
        })?;
        let secret = StaticSecret::from(key_bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Save the private key to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.private_key_base64())?;
        // Owner-only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("Private key saved to {:?}", path);
        Ok(())
    }

    /// Load the keypair, creating and persisting one on first use
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading keypair from {:?}", path);
            Self::load(path)
        } else {
            info!("Generating new keypair, saving to {:?}", path);
            let kp = Self::generate();
            kp.save(path)?;
            Ok(kp)
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::from(self.public)
    }

    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}
