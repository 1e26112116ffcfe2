use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BotError, Result};

/// Longest communication timeout Discord accepts; a challenge cannot outlast the mute
pub const MAX_TIMEOUT_DAYS: u64 = 28;

/// Runtime settings for the gatekeeper
/// Loaded from data/settings.json, then overridden from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// How long a new member has to verify (seconds)
    #[serde(default = "default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,

    /// Period of the expiry sweep (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long welcome and timeout notices stay visible (seconds)
    #[serde(default = "default_notice_display_secs")]
    pub notice_display_secs: u64,

    /// Channel name to post challenges in. Falls back to "welcome", then the first text channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_channel: Option<String>,

    /// Append-only audit log
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,

    #[serde(default)]
    pub web: WebSettings,
}

/// Deep-link web server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebSettings {
    /// Public base URL that verify links are built from
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Path to certificate PEM file (cert + CA bundle)
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// Path to private key PEM file
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

fn default_challenge_ttl_secs() -> u64 {
    180
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_notice_display_secs() -> u64 {
    30
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("bot.log")
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_http_port() -> u16 {
    3000
}

fn default_https_port() -> u16 {
    443
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("certs/cert.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("certs/key.pem")
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: default_challenge_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            notice_display_secs: default_notice_display_secs(),
            verification_channel: None,
            audit_log_path: default_audit_log_path(),
            web: WebSettings::default(),
        }
    }
}

impl Settings {
    /// Load from a JSON file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BotError::ConfigLoad {
            path: path.to_string(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| BotError::ConfigParse {
            path: path.to_string(),
            source: e,
        })
    }

    /// Load the settings file if it exists, apply environment overrides and validate
    pub fn load(path: &str) -> Result<Self> {
        let mut settings = if std::path::Path::new(path).exists() {
            Self::load_from_file(path)?
        } else {
            tracing::info!("No settings file at {}, using defaults", path);
            Self::default()
        };

        settings.apply_env_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CHALLENGE_TTL_SECS") {
            self.challenge_ttl_secs = parse_var("CHALLENGE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse_var("SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("NOTICE_DISPLAY_SECS") {
            self.notice_display_secs = parse_var("NOTICE_DISPLAY_SECS", &v)?;
        }
        if let Some(v) = lookup("VERIFICATION_CHANNEL") {
            self.verification_channel = Some(v);
        }
        if let Some(v) = lookup("AUDIT_LOG_PATH") {
            self.audit_log_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WEB_BASE_URL") {
            self.web.base_url = v;
        }
        if let Some(v) = lookup("HTTP_PORT") {
            self.web.http_port = parse_var("HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("HTTPS_PORT") {
            self.web.https_port = parse_var("HTTPS_PORT", &v)?;
        }
        if let Some(v) = lookup("TLS_CERT_PATH") {
            self.web.cert_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TLS_KEY_PATH") {
            self.web.key_path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("challenge_ttl_secs", self.challenge_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("notice_display_secs", self.notice_display_secs),
        ] {
            if value == 0 {
                return Err(BotError::ConfigValidation {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }

        let max_ttl_secs = MAX_TIMEOUT_DAYS * 24 * 60 * 60;
        if self.challenge_ttl_secs > max_ttl_secs {
            return Err(BotError::ConfigValidation {
                message: format!(
                    "challenge_ttl_secs must be at most {} ({} days)",
                    max_ttl_secs, MAX_TIMEOUT_DAYS
                ),
            });
        }

        if self.web.base_url.trim().is_empty() {
            return Err(BotError::ConfigValidation {
                message: "web.base_url must not be empty".to_string(),
            });
        }

        Ok(())
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn notice_display(&self) -> Duration {
        Duration::from_secs(self.notice_display_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| BotError::ConfigValidation {
        message: format!("{} has an invalid value '{}'", name, value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_reference_timings() {
        let settings = Settings::default();
        assert_eq!(settings.challenge_ttl(), Duration::from_secs(180));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(10));
        assert_eq!(settings.notice_display(), Duration::from_secs(30));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_settings() {
        let json = r#"{
            "sweep_interval_secs": 5,
            "verification_channel": "gate",
            "web": { "base_url": "https://gate.example.org" }
        }"#;

        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.sweep_interval_secs, 5);
        assert_eq!(settings.challenge_ttl_secs, 180);
        assert_eq!(settings.verification_channel.as_deref(), Some("gate"));
        assert_eq!(settings.web.base_url, "https://gate.example.org");
        assert_eq!(settings.web.http_port, 3000);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{ "challenge_ttl": 5 }"#;
        assert!(serde_json::from_str::<Settings>(json).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHALLENGE_TTL_SECS", "60"),
            ("WEB_BASE_URL", "https://verify.example.org"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.challenge_ttl_secs, 60);
        assert_eq!(settings.web.base_url, "https://verify.example.org");
        assert_eq!(settings.sweep_interval_secs, 10);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut settings = Settings::default();
        let result = settings.apply_env_overrides(|key| {
            (key == "SWEEP_INTERVAL_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(BotError::ConfigValidation { .. })));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let settings = Settings {
            sweep_interval_secs: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_challenge_window_capped_at_timeout_limit() {
        let at_limit = Settings {
            challenge_ttl_secs: MAX_TIMEOUT_DAYS * 24 * 60 * 60,
            ..Settings::default()
        };
        assert!(at_limit.validate().is_ok());

        let mut settings = Settings::default();
        settings
            .apply_env_overrides(|key| {
                (key == "CHALLENGE_TTL_SECS").then(|| "9000000000000000".to_string())
            })
            .unwrap();
        assert!(matches!(
            settings.validate(),
            Err(BotError::ConfigValidation { .. })
        ));
    }
}
