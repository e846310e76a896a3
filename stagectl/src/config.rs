use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(name = "stagectl", about = "Credit ledger and generation job control for home staging")]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'f', long, env = "STAGECTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Credits reserved for one generation attempt
    pub transformation_cost: i64,
    /// How long a pending reservation holds credits before the sweeper releases it
    #[serde(with = "humantime_serde")]
    pub reservation_ttl: Duration,
    /// How long a balance projection may be served from memory
    #[serde(with = "humantime_serde")]
    pub stats_cache_ttl: Duration,
    pub polling: PollingConfig,
    pub sweeper: SweeperConfig,
    pub provider: ProviderConfig,
    pub storage: Option<StorageConfig>,
    /// Shared secret the provider echoes in the X-Webhook-Secret header
    pub webhook_secret: Option<String>,
    pub enable_metrics: bool,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Jobs processing for longer than this are failed and their hold released
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    #[serde(with = "humantime_serde", default = "default_provider_timeout")]
    pub timeout: Duration,
    /// Public URL the provider should notify on completion
    pub webhook_url: Option<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub base_url: Url,
    pub bucket: String,
    pub api_key: Option<String>,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            database_url: "postgres://localhost:5432/stagectl".to_string(),
            transformation_cost: 1,
            reservation_ttl: Duration::from_secs(60 * 60),
            stats_cache_ttl: Duration::from_secs(30),
            polling: PollingConfig::default(),
            sweeper: SweeperConfig::default(),
            provider: ProviderConfig::default(),
            storage: None,
            webhook_secret: None,
            enable_metrics: true,
            cors_allowed_origins: vec!["http://localhost:5173".to_string()],
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            job_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:8080").expect("static url is valid"),
            api_key: None,
            timeout: default_provider_timeout(),
            webhook_url: None,
        }
    }
}

impl Config {
    /// Load configuration from the YAML file named in `args`, overlaid with
    /// `STAGECTL_`-prefixed environment variables (`__` separates nested keys).
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let config: Config = Self::figment(args).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("STAGECTL_").split("__"))
            // DATABASE_URL is what sqlx tooling uses, honour it too
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database_url".into()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transformation_cost <= 0 {
            anyhow::bail!("transformation_cost must be a positive integer, got {}", self.transformation_cost);
        }
        if self.polling.enabled {
            if self.polling.max_attempts == 0 {
                anyhow::bail!("polling.max_attempts must be at least 1");
            }
            if self.polling.interval.is_zero() {
                anyhow::bail!("polling.interval must be non-zero");
            }
        }
        if self.sweeper.enabled && (self.sweeper.interval.is_zero() || self.sweeper.job_timeout.is_zero()) {
            anyhow::bail!("sweeper.interval and sweeper.job_timeout must be non-zero");
        }
        // A hold must outlive the job it pays for, up to the sweep that times it out
        let longest_job = self.sweeper.job_timeout.saturating_add(self.sweeper.interval);
        if self.reservation_ttl <= longest_job {
            anyhow::bail!(
                "reservation_ttl ({}) must be longer than sweeper.job_timeout plus sweeper.interval ({})",
                humantime::format_duration(self.reservation_ttl),
                humantime::format_duration(longest_job)
            );
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
        }
    }

    #[test]
    fn test_defaults_when_file_missing() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("does-not-exist.yaml")).expect("defaults should load");
            assert_eq!(config.port, 3001);
            assert_eq!(config.transformation_cost, 1);
            assert_eq!(config.polling.interval, Duration::from_secs(5));
            assert_eq!(config.polling.max_attempts, 60);
            assert!(config.storage.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_yaml_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
port: 8000
transformation_cost: 3
reservation_ttl: 10m
polling:
  interval: 2s
  max_attempts: 5
provider:
  base_url: "https://ai.example.com/v1"
  timeout: 30s
storage:
  base_url: "https://storage.example.com"
  bucket: staged-images
"#,
            )?;
            jail.set_env("STAGECTL_PORT", "9000");
            jail.set_env("STAGECTL_SWEEPER__JOB_TIMEOUT", "5m");
            jail.set_env("DATABASE_URL", "postgres://db/test");

            let config = Config::load(&args("test.yaml")).expect("config should load");
            assert_eq!(config.port, 9000);
            assert_eq!(config.transformation_cost, 3);
            assert_eq!(config.reservation_ttl, Duration::from_secs(600));
            assert_eq!(config.polling.interval, Duration::from_secs(2));
            assert_eq!(config.polling.max_attempts, 5);
            assert_eq!(config.sweeper.job_timeout, Duration::from_secs(300));
            assert_eq!(config.provider.base_url.as_str(), "https://ai.example.com/v1");
            assert_eq!(config.provider.timeout, Duration::from_secs(30));
            assert_eq!(config.storage.as_ref().map(|s| s.bucket.as_str()), Some("staged-images"));
            assert_eq!(config.database_url, "postgres://db/test");
            Ok(())
        });
    }

    #[test]
    fn test_rejects_non_positive_cost() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.yaml", "transformation_cost: 0\n")?;
            let err = Config::load(&args("bad.yaml")).expect_err("zero cost must be rejected");
            assert!(err.to_string().contains("transformation_cost"));
            Ok(())
        });
    }

    #[test]
    fn test_rejects_ttl_shorter_than_job_timeout() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.yaml", "reservation_ttl: 10m\nsweeper:\n  job_timeout: 30m\n")?;
            let err = Config::load(&args("bad.yaml")).expect_err("ttl must exceed job timeout");
            assert!(err.to_string().contains("reservation_ttl"));
            Ok(())
        });
    }

    #[test]
    fn test_ttl_bound_includes_sweep_interval_and_ignores_enabled() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "late_sweep.yaml",
                "reservation_ttl: 31m\nsweeper:\n  job_timeout: 30m\n  interval: 2m\n",
            )?;
            assert!(Config::load(&args("late_sweep.yaml")).is_err());

            jail.create_file(
                "no_sweeper.yaml",
                "reservation_ttl: 10m\nsweeper:\n  enabled: false\n  job_timeout: 30m\n",
            )?;
            assert!(Config::load(&args("no_sweeper.yaml")).is_err());

            jail.create_file(
                "ok.yaml",
                "reservation_ttl: 33m\nsweeper:\n  job_timeout: 30m\n  interval: 2m\n",
            )?;
            assert!(Config::load(&args("ok.yaml")).is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_rejects_zero_poll_attempts() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.yaml", "polling:\n  max_attempts: 0\n")?;
            assert!(Config::load(&args("bad.yaml")).is_err());
            Ok(())
        });
    }
}
