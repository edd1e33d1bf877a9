// crates/keygate-server/src/config/file.rs
// File-based configuration from ~/.keygate/config.toml

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Top-level gateway configuration.
///
/// Every field has a sane default so the gateway starts with an empty file;
/// environment overrides (see [`super::env`]) win over file values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Primary listen address.
    pub listen: String,
    /// Optional second listener for in-cluster callers (plain HTTP,
    /// `X-Agent-Identity` trusted). Empty disables it.
    pub in_cluster_listen: String,
    /// Path to the MCP helper subprocess binary. Empty disables the child.
    pub chapel_binary: String,
    /// Base URL of the secret-store service. Empty disables setec.
    pub setec_url: String,
    /// Name prefix applied to all secret-store keys.
    pub setec_prefix: String,
    /// Secrets refreshed by the background poller.
    pub setec_secrets: Vec<String>,
    /// Secret cache freshness window and poller interval, in seconds.
    pub setec_poll_interval: u64,
    /// Default source precedence for composite resolution.
    pub precedence: Vec<String>,
    /// Base URL of the LLM-usage telemetry plane. Empty disables SSE ingest.
    pub aperture_url: String,
    /// Seconds between SSE reconnect attempts.
    pub aperture_sse_reconnect: u64,
    /// Object-store location of periodic usage exports.
    pub aperture_s3: ApertureS3Config,
    /// Seconds between object-store list polls.
    pub aperture_batch_interval: u64,
    /// Seconds between meter flushes.
    pub meter_flush_interval: u64,
    /// Key prefix for audit exports within the aperture bucket.
    pub audit_s3_prefix: String,
    /// Seconds between audit exports.
    pub audit_s3_interval: u64,
    /// Shared secret required on webhook ingest. Empty disables the check.
    pub webhook_secret: String,
    /// Base URL of the campaign-runner service. Empty disables campaign tools.
    pub campaign_runner_url: String,
    pub tailscale: TailscaleConfig,
}

/// Object-store coordinates for batch ingest and audit export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApertureS3Config {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    /// Explicit endpoint switches URL construction to path style.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl ApertureS3Config {
    pub fn is_configured(&self) -> bool {
        !self.bucket.is_empty()
    }
}

/// Tailnet identity-layer settings, consumed by the operational wrapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TailscaleConfig {
    pub auth_key: String,
    pub hostname: String,
    pub state_dir: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8570".to_string(),
            in_cluster_listen: String::new(),
            chapel_binary: String::new(),
            setec_url: String::new(),
            setec_prefix: "keygate/".to_string(),
            setec_secrets: Vec::new(),
            setec_poll_interval: 300,
            precedence: vec![
                "env".to_string(),
                "sops".to_string(),
                "kdbx".to_string(),
                "setec".to_string(),
            ],
            aperture_url: String::new(),
            aperture_sse_reconnect: 5,
            aperture_s3: ApertureS3Config::default(),
            aperture_batch_interval: 60,
            meter_flush_interval: 60,
            audit_s3_prefix: "audit/".to_string(),
            audit_s3_interval: 300,
            webhook_secret: String::new(),
            campaign_runner_url: String::new(),
            tailscale: TailscaleConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from the given path, or `~/.keygate/config.toml`, then
    /// apply environment overrides. Parse failures fall back to defaults so a
    /// broken file never prevents startup.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        };

        super::env::apply_overrides(&mut config);
        config
    }

    fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keygate/config.toml")
    }

    /// Serialize the effective config with credential fields redacted.
    pub fn redacted_toml(&self) -> crate::Result<String> {
        let mut clone = self.clone();
        for field in [
            &mut clone.aperture_s3.access_key,
            &mut clone.aperture_s3.secret_key,
            &mut clone.webhook_secret,
            &mut clone.tailscale.auth_key,
        ] {
            if !field.is_empty() {
                *field = "<redacted>".to_string();
            }
        }
        toml::to_string_pretty(&clone).map_err(|e| crate::GatewayError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen, "127.0.0.1:8570");
        assert_eq!(config.precedence, vec!["env", "sops", "kdbx", "setec"]);
        assert_eq!(config.setec_poll_interval, 300);
        assert!(!config.aperture_s3.is_configured());
    }

    #[test]
    fn test_load_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
listen = "0.0.0.0:9000"
chapel_binary = "/usr/local/bin/chapel"
precedence = ["env", "setec"]

[aperture_s3]
bucket = "usage-exports"
region = "us-east-1"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(Some(f.path()));
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.chapel_binary, "/usr/local/bin/chapel");
        assert_eq!(config.precedence, vec!["env", "setec"]);
        assert!(config.aperture_s3.is_configured());
        // Untouched fields keep their defaults
        assert_eq!(config.audit_s3_interval, 300);
    }

    #[test]
    fn test_load_malformed_file_falls_back_to_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "listen = [this is not toml").unwrap();
        let config = GatewayConfig::load(Some(f.path()));
        assert_eq!(config.listen, "127.0.0.1:8570");
    }

    #[test]
    fn test_redacted_toml_hides_credentials() {
        let config = GatewayConfig {
            webhook_secret: "hunter2".to_string(),
            aperture_s3: ApertureS3Config {
                bucket: "b".to_string(),
                access_key: "AKID".to_string(),
                secret_key: "very-secret".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let toml = config.redacted_toml().unwrap();
        assert!(!toml.contains("hunter2"));
        assert!(!toml.contains("very-secret"));
        assert!(!toml.contains("AKID"));
        assert!(toml.contains("<redacted>"));
        assert!(toml.contains("bucket = \"b\""));
    }
}
