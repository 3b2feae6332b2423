//! The on-disk configuration store.

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use filament_types::{KeyError, PeeringUrl, PeeringUrlError, PrivateKey};

/// Errors from loading or interpreting the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("identity key: {0}")]
    Key(#[from] KeyError),

    #[error("no identity key configured")]
    MissingIdentity,

    #[error("peering URL: {0}")]
    Url(#[from] PeeringUrlError),

    #[error("friend {name:?} has invalid IP {ip:?}")]
    BadFriendIp { name: String, ip: String },
}

/// Holds all configuration in a storable format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Store {
    pub router: Router,
    pub system: System,

    /// Trusted routers; the isolation gate only forwards to these.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub friends: Vec<FriendConfig>,
}

/// Configuration of the overlay router itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Router {
    /// Hex-encoded Ed25519 identity key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Constrain outgoing traffic to friends.
    pub isolate: bool,

    /// Peering URLs to listen on. Hosts must be IP literals.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,

    /// Peering URLs the router keeps an outbound link to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connect: Vec<String>,

    /// One-shot dial targets used to seed the overlay.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bootstrap: Vec<String>,

    /// Automatically peer with discovered routers.
    pub auto_connect: bool,
}

/// A trusted router in the network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FriendConfig {
    pub name: String,
    pub ip: String,
}

/// Host-system related configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct System {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
}

impl Store {
    /// Generate a fresh configuration with a new identity.
    pub fn generate() -> Self {
        Self {
            router: Router {
                identity: Some(PrivateKey::generate().to_hex()),
                ..Router::default()
            },
            ..Store::default()
        }
    }

    /// Load the store from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write the store to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// The configured identity key.
    pub fn private_key(&self) -> Result<PrivateKey, ConfigError> {
        let hex = self
            .router
            .identity
            .as_deref()
            .ok_or(ConfigError::MissingIdentity)?;
        Ok(PrivateKey::from_hex(hex)?)
    }

    pub fn listen_urls(&self) -> Result<Vec<PeeringUrl>, ConfigError> {
        parse_urls(&self.router.listen)
    }

    pub fn connect_urls(&self) -> Result<Vec<PeeringUrl>, ConfigError> {
        parse_urls(&self.router.connect)
    }

    pub fn bootstrap_urls(&self) -> Result<Vec<PeeringUrl>, ConfigError> {
        parse_urls(&self.router.bootstrap)
    }

    /// Overlay addresses of the configured friends.
    pub fn friend_addrs(&self) -> Result<HashSet<Ipv6Addr>, ConfigError> {
        self.friends
            .iter()
            .map(|f| {
                f.ip.parse().map_err(|_| ConfigError::BadFriendIp {
                    name: f.name.clone(),
                    ip: f.ip.clone(),
                })
            })
            .collect()
    }
}

fn parse_urls(raw: &[String]) -> Result<Vec<PeeringUrl>, ConfigError> {
    raw.iter().map(|s| Ok(s.parse()?)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_roundtrips_through_json() {
        let store = Store::generate();
        let json = serde_json::to_string(&store).unwrap();
        let back: Store = serde_json::from_str(&json).unwrap();
        assert_eq!(
            store.private_key().unwrap().public_key(),
            back.private_key().unwrap().public_key()
        );
    }

    #[test]
    fn missing_identity_is_an_error() {
        let store = Store::default();
        assert!(matches!(store.private_key(), Err(ConfigError::MissingIdentity)));
    }

    #[test]
    fn urls_are_parsed() {
        let store = Store {
            router: Router {
                listen: vec!["tcp://127.0.0.1:4242".into()],
                connect: vec!["tcp://[fd00::1]:4242".into()],
                ..Router::default()
            },
            ..Store::default()
        };
        assert_eq!(store.listen_urls().unwrap().len(), 1);
        assert_eq!(store.connect_urls().unwrap()[0].addr().port(), 4242);
    }

    #[test]
    fn bad_friend_ip_is_reported() {
        let store = Store {
            friends: vec![FriendConfig {
                name: "eve".into(),
                ip: "not-an-ip".into(),
            }],
            ..Store::default()
        };
        assert!(matches!(
            store.friend_addrs(),
            Err(ConfigError::BadFriendIp { .. })
        ));
    }
}
