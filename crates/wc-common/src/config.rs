use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// SQLite database holding `domains` and `certificate_zones`
    pub database_path: PathBuf,
    /// ACME client binary (acme.sh)
    pub acme_bin: String,
    /// Raw DNS provider identifier, normalized later by the ACME crate
    pub acme_provider: Option<String>,
    /// Root directory for installed wildcard certificates (one subdirectory per zone)
    pub cert_dir: PathBuf,
    /// Reload the serving layer after a successful install
    pub reload_on_success: bool,
    pub reload_command: String,
    /// Append-only log of ACME client output
    pub acme_log: Option<PathBuf>,
    /// Per-invocation timeout for the ACME client
    pub acme_timeout_secs: u64,
    /// Days between issuance and the next renewal
    pub renewal_days: u32,
    /// Renew early when the certificate on disk expires within this many days
    pub renewal_lead_days: u32,
    /// Wildcard flag for newly registered zones
    pub wildcard_enabled: bool,
    /// Optional ACME directory (`--server`)
    pub acme_server: Option<String>,
    /// Optional public suffix list file
    pub public_suffix_list: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/wildcert/wildcert.db"),
            acme_bin: "acme.sh".to_string(),
            acme_provider: None,
            cert_dir: PathBuf::from("/etc/nginx/wildcard-certs"),
            reload_on_success: false,
            reload_command: "nginx -s reload".to_string(),
            acme_log: None,
            acme_timeout_secs: 300,
            renewal_days: 60,
            renewal_lead_days: 30,
            wildcard_enabled: true,
            acme_server: None,
            public_suffix_list: None,
        }
    }
}

impl EnvConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ACME_SH_BIN") {
            if !v.trim().is_empty() {
                config.acme_bin = v.trim().to_string();
            }
        }
        if let Some(v) = lookup("ACME_WILDCARD_PROVIDER") {
            config.acme_provider = Some(v);
        }
        if let Some(v) = lookup("NGINX_WILDCARD_CERT_DIR") {
            config.cert_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ACME_RELOAD_ON_SUCCESS") {
            config.reload_on_success = parse_bool(&v);
        }
        if let Some(v) = lookup("ACME_RELOAD_COMMAND") {
            config.reload_command = v;
        }
        if let Some(v) = lookup("ACME_LOG") {
            if !v.trim().is_empty() {
                config.acme_log = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = lookup("ACME_TIMEOUT_SECS") {
            if let Ok(secs) = v.trim().parse() {
                config.acme_timeout_secs = secs;
            }
        }
        if let Some(v) = lookup("ACME_RENEWAL_DAYS") {
            if let Ok(days) = v.trim().parse() {
                config.renewal_days = days;
            }
        }
        if let Some(v) = lookup("ACME_RENEWAL_LEAD_DAYS") {
            if let Ok(days) = v.trim().parse() {
                config.renewal_lead_days = days;
            }
        }
        if let Some(v) = lookup("ACME_WILDCARD_ENABLED") {
            config.wildcard_enabled = parse_bool(&v);
        }
        if let Some(v) = lookup("ACME_SERVER") {
            if !v.trim().is_empty() {
                config.acme_server = Some(v.trim().to_string());
            }
        }
        if let Some(v) = lookup("PUBLIC_SUFFIX_LIST") {
            if !v.trim().is_empty() {
                config.public_suffix_list = Some(PathBuf::from(v));
            }
        }

        config
    }

    /// Load a `.env` file, then the environment
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [PathBuf::from("/etc/wildcert/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    /// Reject settings that would make a maintenance run meaningless
    pub fn validate(&self) -> Result<(), AppError> {
        if self.acme_bin.is_empty() {
            return Err(AppError::Config("ACME_SH_BIN is empty".into()));
        }
        if self.acme_timeout_secs == 0 {
            return Err(AppError::Config("ACME_TIMEOUT_SECS must be > 0".into()));
        }
        if self.renewal_days == 0 {
            return Err(AppError::Config("ACME_RENEWAL_DAYS must be > 0".into()));
        }
        if self.reload_on_success && self.reload_argv().is_empty() {
            return Err(AppError::Config(
                "ACME_RELOAD_ON_SUCCESS is set but ACME_RELOAD_COMMAND is empty".into(),
            ));
        }
        Ok(())
    }

    /// Create the certificate root and the database directory
    pub fn ensure_directories(&self) -> Result<(), AppError> {
        std::fs::create_dir_all(&self.cert_dir)?;
        if let Some(parent) = self.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if let Some(parent) = self.acme_log.as_deref().and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Reload command split into program and arguments
    pub fn reload_argv(&self) -> Vec<String> {
        self.reload_command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Basic `.env` loader (KEY=VALUE per line); existing variables win
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before the runtime spawns any threads
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = config_from(&[]);
        assert_eq!(config.acme_bin, "acme.sh");
        assert_eq!(config.acme_provider, None);
        assert_eq!(config.renewal_days, 60);
        assert_eq!(config.renewal_lead_days, 30);
        assert!(config.wildcard_enabled);
        assert!(!config.reload_on_success);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = config_from(&[
            ("ACME_SH_BIN", "/opt/acme/acme.sh"),
            ("ACME_WILDCARD_PROVIDER", "cloudflare"),
            ("NGINX_WILDCARD_CERT_DIR", "/srv/certs"),
            ("ACME_RELOAD_ON_SUCCESS", "TRUE"),
            ("ACME_LOG", "/var/log/acme.log"),
            ("ACME_TIMEOUT_SECS", "90"),
            ("ACME_RENEWAL_DAYS", "45"),
        ]);

        assert_eq!(config.acme_bin, "/opt/acme/acme.sh");
        assert_eq!(config.acme_provider.as_deref(), Some("cloudflare"));
        assert_eq!(config.cert_dir, PathBuf::from("/srv/certs"));
        assert!(config.reload_on_success);
        assert_eq!(config.acme_log, Some(PathBuf::from("/var/log/acme.log")));
        assert_eq!(config.acme_timeout_secs, 90);
        assert_eq!(config.renewal_days, 45);
    }

    #[test]
    fn test_invalid_numbers_keep_defaults() {
        let config = config_from(&[("ACME_TIMEOUT_SECS", "soon"), ("ACME_RELOAD_ON_SUCCESS", "0")]);
        assert_eq!(config.acme_timeout_secs, 300);
        assert!(!config.reload_on_success);
    }

    #[test]
    fn test_validate_rejects_empty_reload_command() {
        let config = config_from(&[
            ("ACME_RELOAD_ON_SUCCESS", "1"),
            ("ACME_RELOAD_COMMAND", "   "),
        ]);
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }
}
