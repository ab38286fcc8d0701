use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::container::pool::PoolConfig;
use crate::container::resource_limits::ResourceLimits;
use crate::recovery::CircuitBreakerConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,
    pub orchestrator: OrchestratorConfig,
    pub pool: PoolSettings,
    pub limits: ResourceLimits,
    pub breaker: BreakerSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// First host port the deterministic allocator scans.
    pub port_base: u16,
    /// Number of ports in the allocator's range.
    pub port_span: u16,
    pub default_image: String,
    /// RUNNING workspaces inactive this long are reclaimed.
    pub idle_minutes: i64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    pub enabled: bool,
    pub images: Vec<String>,
    pub warm_per_image: usize,
    pub max_per_image: usize,
    pub max_idle_secs: u64,
    /// Dedicated port range for pooled containers; must not overlap the
    /// orchestrator's range.
    pub port_base: u16,
    pub port_span: u16,
}

impl PoolSettings {
    pub fn to_pool_config(&self, limits: ResourceLimits) -> PoolConfig {
        PoolConfig {
            images: self.images.clone(),
            warm_per_image: self.warm_per_image,
            max_per_image: self.max_per_image,
            max_idle: Duration::from_secs(self.max_idle_secs),
            port_base: self.port_base,
            port_span: self.port_span,
            limits,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerSettings {
    pub recovery_timeout_secs: u64,
    pub monitoring_period_secs: u64,
    pub expected_failure_rate: f64,
    pub minimum_request_threshold: u32,
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            monitoring_period: Duration::from_secs(self.monitoring_period_secs),
            expected_failure_rate: self.expected_failure_rate,
            minimum_request_threshold: self.minimum_request_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                url: "sqlite:workden.db?mode=rwc".to_string(),
            },
            orchestrator: OrchestratorConfig {
                port_base: 41000,
                port_span: 500,
                default_image: "ubuntu:24.04".to_string(),
                idle_minutes: 30,
                sweep_interval_secs: 300,
            },
            pool: PoolSettings {
                enabled: true,
                images: vec!["ubuntu:24.04".to_string()],
                warm_per_image: 2,
                max_per_image: 8,
                max_idle_secs: 300,
                port_base: 42000,
                port_span: 512,
            },
            limits: ResourceLimits::default(),
            breaker: BreakerSettings {
                recovery_timeout_secs: 30,
                monitoring_period_secs: 60,
                expected_failure_rate: 0.5,
                minimum_request_threshold: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(url) = std::env::var("WORKDEN_STORE_URL") {
            config.store.url = url;
        }
        if let Ok(image) = std::env::var("WORKDEN_DEFAULT_IMAGE") {
            config.orchestrator.default_image = image;
        }
        if let Ok(base) = std::env::var("WORKDEN_PORT_BASE") {
            config.orchestrator.port_base = base.parse().unwrap_or(41000);
        }
        if let Ok(minutes) = std::env::var("WORKDEN_IDLE_MINUTES") {
            config.orchestrator.idle_minutes = minutes.parse().unwrap_or(30);
        }
        if let Ok(level) = std::env::var("WORKDEN_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file (workden.toml).
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.port_span == 0 {
            anyhow::bail!("orchestrator port span cannot be 0");
        }

        if !(0.0..=1.0).contains(&self.breaker.expected_failure_rate) {
            anyhow::bail!("expected failure rate must be within 0..=1");
        }

        if self.orchestrator.idle_minutes <= 0 {
            anyhow::bail!("idle minutes must be positive");
        }

        if self.pool.enabled {
            let orch_end = self.orchestrator.port_base as u32 + self.orchestrator.port_span as u32;
            let pool_end = self.pool.port_base as u32 + self.pool.port_span as u32;
            let overlap = (self.orchestrator.port_base as u32) < pool_end
                && (self.pool.port_base as u32) < orch_end;
            if overlap {
                anyhow::bail!("pool port range overlaps the orchestrator port range");
            }
            if self.pool.warm_per_image > self.pool.max_per_image {
                anyhow::bail!("pool warm count exceeds the per-image cap");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn overlapping_port_ranges_rejected() {
        let mut config = Config::default();
        config.pool.port_base = config.orchestrator.port_base;
        assert!(config.validate().is_err());
    }

    #[test]
    fn failure_rate_out_of_range_rejected() {
        let mut config = Config::default();
        config.breaker.expected_failure_rate = 1.5;
        assert!(config.validate().is_err());
    }
}
