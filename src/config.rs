//! Typed, environment-driven startup configuration (§6, §10.3).
//!
//! Loaded once at boot via [`Config::from_env`] and threaded as an explicit
//! dependency into the components that need it, rather than read ad hoc from
//! `std::env` scattered through business logic.

use serde::Deserialize;

fn default_db_name() -> String {
    "control_plane.db".to_string()
}

fn default_check_interval() -> u64 {
    3600
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_timeout() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    3600
}

/// Top-level configuration, deserialized from environment variables.
///
/// Every field carries a default so the service boots with no environment
/// at all; callers that need stricter validation (e.g. a non-empty admin
/// allowlist) perform it explicitly after loading.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub db_host: Option<String>,
    #[serde(default)]
    pub db_port: Option<u16>,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,

    /// Shared-secret allowlist for admin mutations. Empty ⇒ admin routes
    /// always return `unavailable`.
    #[serde(default)]
    pub admin_keys: Vec<String>,

    #[serde(default = "default_check_interval")]
    pub check_interval_sec: u64,

    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_timeout")]
    pub circuit_timeout_sec: u64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_sec: u64,

    #[serde(default)]
    pub moderation_provider: Option<String>,
    #[serde(default)]
    pub moderation_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_host: None,
            db_port: None,
            db_name: default_db_name(),
            db_user: None,
            db_password: None,
            admin_keys: Vec::new(),
            check_interval_sec: default_check_interval(),
            circuit_failure_threshold: default_failure_threshold(),
            circuit_timeout_sec: default_circuit_timeout(),
            cache_ttl_sec: default_cache_ttl(),
            moderation_provider: None,
            moderation_api_key: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// defaults for anything unset. `ADMIN_KEYS` is parsed as a
    /// comma-separated list.
    pub fn from_env() -> crate::Result<Self> {
        let admin_keys = std::env::var("ADMIN_KEYS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut config: Config = envy::prefixed("")
            .from_env()
            .map_err(|e| crate::Error::internal(format!("config error: {e}")))?;
        config.admin_keys = admin_keys;
        Ok(config)
    }

    /// Whether `key` is present in the admin allowlist. Always `false` when
    /// the allowlist is empty, per §6's "allowlist empty ⇒ unavailable" rule.
    pub fn is_admin_key_allowed(&self, key: &str) -> bool {
        !self.admin_keys.is_empty() && self.admin_keys.iter().any(|k| k == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.check_interval_sec, 3600);
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.circuit_timeout_sec, 60);
        assert_eq!(config.cache_ttl_sec, 3600);
        assert!(config.admin_keys.is_empty());
    }

    #[test]
    fn empty_allowlist_rejects_every_key() {
        let config = Config::default();
        assert!(!config.is_admin_key_allowed("anything"));
    }

    #[test]
    fn populated_allowlist_matches_exact_key() {
        let mut config = Config::default();
        config.admin_keys = vec!["secret-1".to_string(), "secret-2".to_string()];
        assert!(config.is_admin_key_allowed("secret-1"));
        assert!(!config.is_admin_key_allowed("secret-3"));
    }
}
