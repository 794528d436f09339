use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use config::builder::DefaultState;
use config::{File, FileFormat, Source};
use serde::{Deserialize, Serialize};

use crate::reconnection::policy::{
    ConstantReconnectionPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy,
};
use crate::TOPOLOGY_CONFIG;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub reconnection: ReconnectionConfig,
    pub reconciliation: ReconciliationConfig,
    pub control: ControlConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Exponential,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    pub policy: PolicyKind,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub random_factor: f64,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl ReconnectionConfig {
    pub fn policy(&self) -> Arc<dyn ReconnectionPolicy> {
        match self.policy {
            PolicyKind::Exponential => Arc::new(ExponentialReconnectionPolicy::new(
                self.base_delay,
                self.max_delay,
                self.random_factor,
            )),
            PolicyKind::Constant => Arc::new(ConstantReconnectionPolicy::new(self.base_delay)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive refreshes a host may be missing from before it is retired.
    pub absence_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub retired_history: usize,
    pub event_buffer: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            reconnection: ReconnectionConfig {
                policy: PolicyKind::Exponential,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                random_factor: 0.0,
                connect_timeout: Duration::from_secs(5),
            },
            reconciliation: ReconciliationConfig {
                interval: Duration::from_secs(10),
                absence_threshold: 3,
                query_timeout: Duration::from_secs(5),
            },
            control: ControlConfig {
                connect_timeout: Duration::from_secs(5),
            },
            registry: RegistryConfig {
                retired_history: 32,
                event_buffer: 1024,
            },
        }
    }
}

impl TopologyConfig {
    pub fn builder() -> TopologyConfigBuilder {
        TopologyConfigBuilder::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let reconnection = &self.reconnection;
        if reconnection.base_delay.is_zero() {
            return Err(anyhow!("reconnection.base_delay must be > 0"));
        }
        if reconnection.max_delay < reconnection.base_delay {
            return Err(anyhow!(
                "reconnection.max_delay {:?} must be >= base_delay {:?}",
                reconnection.max_delay,
                reconnection.base_delay
            ));
        }
        if !(0.0..=1.0).contains(&reconnection.random_factor) {
            return Err(anyhow!("reconnection.random_factor must be between 0.0 and 1.0"));
        }
        if reconnection.connect_timeout.is_zero() || self.control.connect_timeout.is_zero() {
            return Err(anyhow!("connect timeouts must be > 0"));
        }
        if self.reconciliation.interval.is_zero() {
            return Err(anyhow!("reconciliation.interval must be > 0"));
        }
        if self.reconciliation.absence_threshold == 0 {
            return Err(anyhow!("reconciliation.absence_threshold must be >= 1"));
        }
        if self.registry.event_buffer == 0 {
            return Err(anyhow!("registry.event_buffer must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct TopologyConfigBuilder {
    builder: config::ConfigBuilder<DefaultState>,
}

impl Default for TopologyConfigBuilder {
    fn default() -> Self {
        let builder = config::Config::builder()
            .add_source(File::from_str(TOPOLOGY_CONFIG, FileFormat::Toml));
        Self { builder }
    }
}

impl TopologyConfigBuilder {
    /// Sources added later override earlier ones, the embedded defaults come first.
    pub fn add_source<T>(self, source: T) -> Self
    where
        T: Source + Send + Sync + 'static,
    {
        Self {
            builder: self.builder.add_source(source),
        }
    }

    pub fn build(self) -> anyhow::Result<TopologyConfig> {
        let config = self
            .builder
            .build()?
            .try_deserialize::<TopologyConfig>()
            .context("deserialize topology config")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use config::{File, FileFormat};

    use crate::config::{PolicyKind, TopologyConfig};

    #[test]
    fn test_embedded_defaults() -> anyhow::Result<()> {
        let config = TopologyConfig::builder().build()?;
        assert_eq!(config, TopologyConfig::default());
        Ok(())
    }

    #[test]
    fn test_override() -> anyhow::Result<()> {
        let overrides = r#"
            [reconnection]
            policy = "constant"
            base_delay = "250ms"

            [reconciliation]
            absence_threshold = 5
        "#;
        let config = TopologyConfig::builder()
            .add_source(File::from_str(overrides, FileFormat::Toml))
            .build()?;
        assert_eq!(config.reconnection.policy, PolicyKind::Constant);
        assert_eq!(config.reconnection.base_delay, Duration::from_millis(250));
        assert_eq!(config.reconnection.max_delay, Duration::from_secs(60));
        assert_eq!(config.reconciliation.absence_threshold, 5);
        println!("{}", toml::to_string(&config)?);
        Ok(())
    }

    #[test]
    fn test_validate() {
        let mut config = TopologyConfig::default();
        config.reconnection.max_delay = Duration::from_millis(10);
        assert!(config.validate().is_err());
        let mut config = TopologyConfig::default();
        config.reconnection.random_factor = 1.5;
        assert!(config.validate().is_err());
        let mut config = TopologyConfig::default();
        config.reconciliation.absence_threshold = 0;
        assert!(config.validate().is_err());
        assert!(TopologyConfig::default().validate().is_ok());
    }
}
