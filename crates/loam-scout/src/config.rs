use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use loam_core::Platform;
use serde::Deserialize;
use tokio::fs;

use crate::limiter::RateLimit;
use crate::scout::ScoutJob;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoamConfig {
    pub database_url: String,
    pub registry_path: PathBuf,
    pub tag_rules_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub job_timeout_secs: u64,
    pub login_timeout_secs: u64,
}

impl LoamConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://loam.db".to_string()),
            registry_path: lookup("LOAM_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scouts.yaml")),
            tag_rules_path: lookup("LOAM_TAG_RULES")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            scheduler_enabled: lookup("LOAM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: lookup("LOAM_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            user_agent: lookup("LOAM_USER_AGENT").unwrap_or_else(|| "loam-scout/0.1".to_string()),
            http_timeout_secs: secs("LOAM_HTTP_TIMEOUT_SECS", 20),
            job_timeout_secs: secs("LOAM_JOB_TIMEOUT_SECS", 60),
            login_timeout_secs: secs("LOAM_LOGIN_TIMEOUT_SECS", 300),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoutRegistry {
    #[serde(default)]
    pub scouts: Vec<ScoutConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoutConfig {
    pub platform: Platform,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub login_url: Option<String>,
    #[serde(default)]
    pub logged_in_selector: Option<String>,
    #[serde(default)]
    pub health_url: Option<String>,
    /// Overrides for the platform's default CSS selectors, by key.
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,
    #[serde(default)]
    pub jobs: Vec<ScoutJob>,
}

fn enabled_by_default() -> bool {
    true
}

impl ScoutConfig {
    pub fn rate_limit(&self) -> RateLimit {
        self.rate_limit
            .unwrap_or_else(|| RateLimit::default_for(self.platform))
    }
}

impl ScoutRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: ScoutRegistry = serde_yaml::from_str(text).context("parsing scout registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ScoutConfig> {
        self.scouts.iter().filter(|s| s.enabled)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = Vec::new();
        for scout in &self.scouts {
            if seen.contains(&scout.platform) {
                anyhow::bail!("platform {} is configured more than once", scout.platform);
            }
            seen.push(scout.platform);
            if scout.login_url.is_some() != scout.logged_in_selector.is_some() {
                anyhow::bail!(
                    "{}: login_url and logged_in_selector must be set together",
                    scout.platform
                );
            }
            if let Some(limit) = scout.rate_limit {
                if limit.max_requests == 0 || limit.window_secs == 0 {
                    anyhow::bail!("{}: rate_limit values must be positive", scout.platform);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    const REGISTRY: &str = r#"
scouts:
  - platform: video
    jobs:
      - id: rustconf-keynote
        url: https://www.youtube.com/watch?v=abc123
  - platform: chat_transcript
    rate_limit: { max_requests: 1, window_secs: 30 }
    login_url: https://chatgpt.com/auth/login
    logged_in_selector: "nav[aria-label='Chat history']"
    selectors:
      message: "div.message"
  - platform: forum_thread
    enabled: false
"#;

    #[test]
    fn env_defaults_apply_when_unset() {
        let config = LoamConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, "sqlite://loam.db");
        assert_eq!(config.registry_path, PathBuf::from("scouts.yaml"));
        assert_eq!(config.tag_rules_path, None);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.cron, "0 0 6 * * *");
        assert_eq!(config.job_timeout(), Duration::from_secs(60));
        assert_eq!(config.login_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn env_overrides_are_parsed() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "sqlite::memory:"),
            ("LOAM_SCHEDULER_ENABLED", "true"),
            ("LOAM_HTTP_TIMEOUT_SECS", "5"),
            ("LOAM_JOB_TIMEOUT_SECS", "not-a-number"),
            ("LOAM_TAG_RULES", "rules/tags.yaml"),
        ]);
        let config = LoamConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(config.scheduler_enabled);
        assert_eq!(config.http_timeout(), Duration::from_secs(5));
        assert_eq!(config.job_timeout_secs, 60);
        assert_eq!(config.tag_rules_path, Some(PathBuf::from("rules/tags.yaml")));
    }

    #[test]
    fn registry_fills_defaults_and_filters_disabled() {
        let registry = ScoutRegistry::from_yaml_str(REGISTRY).unwrap();
        let enabled: Vec<Platform> = registry.enabled().map(|s| s.platform).collect();
        assert_eq!(enabled, vec![Platform::Video, Platform::ChatTranscript]);

        let video = &registry.scouts[0];
        assert_eq!(video.rate_limit(), RateLimit::default_for(Platform::Video));
        assert_eq!(video.jobs[0].id, "rustconf-keynote");

        let chat = &registry.scouts[1];
        assert_eq!(chat.rate_limit().max_requests, 1);
        assert_eq!(chat.selectors["message"], "div.message");
    }

    #[test]
    fn registry_rejects_half_configured_login_and_duplicates() {
        let half = "scouts:\n  - platform: video\n    login_url: https://example.com\n";
        assert!(ScoutRegistry::from_yaml_str(half).is_err());

        let dup = "scouts:\n  - platform: video\n  - platform: video\n";
        assert!(ScoutRegistry::from_yaml_str(dup).is_err());

        let unknown = "scouts:\n  - platform: podcast\n";
        assert!(ScoutRegistry::from_yaml_str(unknown).is_err());
    }

    #[tokio::test]
    async fn registry_loads_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scouts.yaml");
        std::fs::write(&path, REGISTRY).unwrap();
        let registry = ScoutRegistry::load(&path).await.unwrap();
        assert_eq!(registry.scouts.len(), 3);

        let missing = ScoutRegistry::load(&dir.path().join("absent.yaml")).await.unwrap_err();
        assert!(format!("{missing:#}").contains("absent.yaml"));
    }
}
