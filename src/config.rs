//! Engine configuration.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::KEY_SIZE;

/// Declarative engine configuration.
///
/// Everything here can also be set programmatically on the engine; the
/// struct exists so hosts can keep the whole tunnel definition in one
/// TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// UDP port to bind (0 for ephemeral).
    pub port: u16,

    /// Enable IPv4.
    #[serde(default = "default_true")]
    pub ipv4: bool,

    /// Enable IPv6 (with both enabled the socket is dual-stack).
    #[serde(default)]
    pub ipv6: bool,

    /// Prefer AES-256-GCM when the hardware has it.
    #[serde(default)]
    pub prefer_aes: bool,

    /// Local MTU.
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Control retransmission / path-recovery interval.
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Freshness window for inbound timestamps.
    #[serde(default = "default_time_tolerance", with = "humantime_serde")]
    pub time_tolerance: Duration,

    /// Pre-shared key, base64 (unpadded URL-safe). Random when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Configured peer endpoints.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// One operator-configured path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Local address to send from (selects the uplink).
    pub local: IpAddr,
    /// Remote address (literal; no DNS).
    pub remote: IpAddr,
    /// Remote port.
    pub port: u16,
    /// Use this path only when every primary path is silent.
    #[serde(default)]
    pub backup: bool,
}

fn default_true() -> bool {
    true
}
fn default_mtu() -> usize {
    1400
}
fn default_send_timeout() -> Duration {
    Duration::from_secs(1)
}
fn default_time_tolerance() -> Duration {
    Duration::from_secs(600)
}

impl Default for Config {
    fn default() -> Self {
        Self::on_port(0)
    }
}

impl Config {
    /// Minimal v4-only configuration on `port`.
    pub fn on_port(port: u16) -> Self {
        Self {
            port,
            ipv4: true,
            ipv6: false,
            prefer_aes: false,
            mtu: default_mtu(),
            send_timeout: default_send_timeout(),
            time_tolerance: default_time_tolerance(),
            key: None,
            peers: Vec::new(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config: {e}")))?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.ipv4 && !self.ipv6 {
            return Err(Error::Config(
                "at least one of ipv4/ipv6 must be enabled".into(),
            ));
        }
        for peer in &self.peers {
            if peer.port == 0 {
                return Err(Error::Config(format!(
                    "peer {} has port 0",
                    peer.remote
                )));
            }
            if peer.local.is_ipv4() != peer.remote.is_ipv4() {
                return Err(Error::Config(format!(
                    "peer {} mixes address families",
                    peer.remote
                )));
            }
        }
        self.key_bytes().map(|_| ())
    }

    /// Decode the configured pre-shared key, if any.
    pub fn key_bytes(&self) -> Result<Option<[u8; KEY_SIZE]>> {
        let Some(encoded) = &self.key else {
            return Ok(None);
        };
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::Config(format!("invalid base64 key: {e}")))?;
        if raw.len() != KEY_SIZE {
            return Err(Error::Config(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&raw);
        Ok(Some(key))
    }

    /// Encode a pre-shared key into the config representation.
    pub fn encode_key(key: &[u8; KEY_SIZE]) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key)
    }
}
