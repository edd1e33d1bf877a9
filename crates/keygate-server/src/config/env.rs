// crates/keygate-server/src/config/env.rs
// Environment overrides - every file key has a KEYGATE_* variable that wins

use tracing::warn;

use super::GatewayConfig;

/// Apply environment overrides on top of file values.
///
/// String variables replace the file value outright; list variables are
/// comma-separated; interval variables must parse as unsigned seconds or the
/// override is ignored with a warning.
pub fn apply_overrides(config: &mut GatewayConfig) {
    override_string("KEYGATE_LISTEN", &mut config.listen);
    override_string("KEYGATE_IN_CLUSTER_LISTEN", &mut config.in_cluster_listen);
    override_string("KEYGATE_CHAPEL_BINARY", &mut config.chapel_binary);
    override_string("KEYGATE_SETEC_URL", &mut config.setec_url);
    override_string("KEYGATE_SETEC_PREFIX", &mut config.setec_prefix);
    override_list("KEYGATE_SETEC_SECRETS", &mut config.setec_secrets);
    override_seconds("KEYGATE_SETEC_POLL_INTERVAL", &mut config.setec_poll_interval);
    override_list("KEYGATE_PRECEDENCE", &mut config.precedence);
    override_string("KEYGATE_APERTURE_URL", &mut config.aperture_url);
    override_string("KEYGATE_APERTURE_S3_BUCKET", &mut config.aperture_s3.bucket);
    override_string("KEYGATE_APERTURE_S3_REGION", &mut config.aperture_s3.region);
    override_string("KEYGATE_APERTURE_S3_PREFIX", &mut config.aperture_s3.prefix);
    override_string("KEYGATE_APERTURE_S3_ENDPOINT", &mut config.aperture_s3.endpoint);
    override_string(
        "KEYGATE_APERTURE_S3_ACCESS_KEY",
        &mut config.aperture_s3.access_key,
    );
    override_string(
        "KEYGATE_APERTURE_S3_SECRET_KEY",
        &mut config.aperture_s3.secret_key,
    );
    override_seconds(
        "KEYGATE_APERTURE_BATCH_INTERVAL",
        &mut config.aperture_batch_interval,
    );
    override_seconds("KEYGATE_METER_FLUSH_INTERVAL", &mut config.meter_flush_interval);
    override_string("KEYGATE_AUDIT_S3_PREFIX", &mut config.audit_s3_prefix);
    override_seconds("KEYGATE_AUDIT_S3_INTERVAL", &mut config.audit_s3_interval);
    override_string("KEYGATE_WEBHOOK_SECRET", &mut config.webhook_secret);
    override_string(
        "KEYGATE_CAMPAIGN_RUNNER_URL",
        &mut config.campaign_runner_url,
    );
    override_string("KEYGATE_TS_AUTHKEY", &mut config.tailscale.auth_key);
    override_string("KEYGATE_TS_HOSTNAME", &mut config.tailscale.hostname);
    override_string("KEYGATE_TS_STATE_DIR", &mut config.tailscale.state_dir);
}

fn override_string(name: &str, target: &mut String) {
    if let Some(value) = read_env(name) {
        *target = value;
    }
}

fn override_list(name: &str, target: &mut Vec<String>) {
    if let Some(value) = read_env(name) {
        *target = value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

fn override_seconds(name: &str, target: &mut u64) {
    if let Some(value) = read_env(name) {
        match value.parse::<u64>() {
            Ok(secs) => *target = secs,
            Err(_) => warn!(var = name, value = %value, "Ignoring non-numeric interval override"),
        }
    }
}

/// Read a single env var, filtering empty values.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a boolean environment variable (1/true/yes/on vs 0/false/no/off).
pub fn parse_bool_env(name: &str) -> Option<bool> {
    let value = read_env(name)?;
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests share process state; use distinct names per test.

    #[test]
    fn test_override_string_and_list() {
        let mut config = GatewayConfig::default();
        // SAFETY: test-only env mutation, unique variable names
        unsafe {
            std::env::set_var("KEYGATE_SETEC_URL", "https://setec.example");
            std::env::set_var("KEYGATE_PRECEDENCE", "env, setec");
        }
        apply_overrides(&mut config);
        assert_eq!(config.setec_url, "https://setec.example");
        assert_eq!(config.precedence, vec!["env", "setec"]);
        unsafe {
            std::env::remove_var("KEYGATE_SETEC_URL");
            std::env::remove_var("KEYGATE_PRECEDENCE");
        }
    }

    #[test]
    fn test_override_seconds_ignores_garbage() {
        let mut config = GatewayConfig::default();
        unsafe {
            std::env::set_var("KEYGATE_AUDIT_S3_INTERVAL", "not-a-number");
        }
        apply_overrides(&mut config);
        assert_eq!(config.audit_s3_interval, 300);
        unsafe {
            std::env::remove_var("KEYGATE_AUDIT_S3_INTERVAL");
        }
    }

    #[test]
    fn test_parse_bool_env() {
        unsafe {
            std::env::set_var("KEYGATE_TEST_BOOL", "yes");
        }
        assert_eq!(parse_bool_env("KEYGATE_TEST_BOOL"), Some(true));
        unsafe {
            std::env::set_var("KEYGATE_TEST_BOOL", "off");
        }
        assert_eq!(parse_bool_env("KEYGATE_TEST_BOOL"), Some(false));
        unsafe {
            std::env::set_var("KEYGATE_TEST_BOOL", "maybe");
        }
        assert_eq!(parse_bool_env("KEYGATE_TEST_BOOL"), None);
        unsafe {
            std::env::remove_var("KEYGATE_TEST_BOOL");
        }
        assert_eq!(parse_bool_env("KEYGATE_TEST_BOOL"), None);
    }
}
