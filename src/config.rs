//! Gateway configuration file
//!
//! A YAML file holding the listen address, the backends a frontend dials and
//! the multiplexer tuning. Every key is optional:
//!
//! ```yaml
//! listen: "0.0.0.0:8000"
//! backends:
//!   - "10.0.0.5:7000"
//! mux:
//!   conn_queue: 256
//!   heartbeat_interval_ms: 5000
//!   heartbeat_timeout_ms: 15000
//!   link:
//!     send_queue: 512
//! ```

use anyhow::{Context, Result};
use muxgate_transport::MuxConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest frame that still carries every command header
const MIN_FRAME_LEN: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to accept clients (frontend) or frontend links (backend) on
    pub listen: Option<String>,

    /// Backend addresses dialed by a frontend
    pub backends: Vec<String>,

    pub mux: MuxConfig,
}

impl GatewayConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mux = &self.mux;

        if mux.link.send_queue == 0 {
            anyhow::bail!("mux.link.send_queue must be at least 1");
        }
        if mux.link.max_frame_len < MIN_FRAME_LEN {
            anyhow::bail!("mux.link.max_frame_len must be at least {}", MIN_FRAME_LEN);
        }
        if mux.conn_queue == 0 {
            anyhow::bail!("mux.conn_queue must be at least 1");
        }
        if mux.ready_backlog == 0 {
            anyhow::bail!("mux.ready_backlog must be at least 1");
        }

        if let Some(interval) = mux.heartbeat_interval_ms {
            if interval == 0 {
                anyhow::bail!("mux.heartbeat_interval_ms must be at least 1");
            }
            if mux.heartbeat_timeout_ms <= interval {
                anyhow::bail!(
                    "mux.heartbeat_timeout_ms ({}) must exceed mux.heartbeat_interval_ms ({})",
                    mux.heartbeat_timeout_ms,
                    interval
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_empty_config() {
        let config = GatewayConfig::parse("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
listen: "127.0.0.1:8000"
backends:
  - "10.0.0.5:7000"
  - "10.0.0.6:7000"
mux:
  conn_queue: 256
  ready_backlog: 32
  heartbeat_interval_ms: 5000
  heartbeat_timeout_ms: 15000
  link:
    send_queue: 512
"#;
        let config = GatewayConfig::parse(yaml).unwrap();

        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:8000"));
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.mux.conn_queue, 256);
        assert_eq!(config.mux.ready_backlog, 32);
        assert_eq!(config.mux.heartbeat_interval_ms, Some(5000));
        assert_eq!(config.mux.link.send_queue, 512);
        // Untouched keys keep their defaults
        assert_eq!(config.mux.link.max_frame_len, 16 * 1024 * 1024);
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let yaml = r#"
mux:
  heartbeat_interval_ms: 5000
  heartbeat_timeout_ms: 5000
"#;
        let err = GatewayConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("heartbeat_timeout_ms"));
    }

    #[test]
    fn test_zero_queue_rejected() {
        assert!(GatewayConfig::parse("mux:\n  conn_queue: 0\n").is_err());
        assert!(GatewayConfig::parse("mux:\n  link:\n    send_queue: 0\n").is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(GatewayConfig::parse("backends: [unterminated").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen: \"0.0.0.0:7000\"").unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.listen.as_deref(), Some("0.0.0.0:7000"));

        assert!(GatewayConfig::load(Path::new("/nonexistent/muxgate.yml")).is_err());
    }
}
