use std::sync::Arc;

use serde::Deserialize;

use crate::filters::{FrameLoggerFactory, RejectCreateTopicsFactory};
use crate::net_filter::HostPort;
use crate::{FilterFactory, ProxyBuilder};

/// Top-level proxy configuration. Format-agnostic (TOML, JSON, YAML via
/// serde); the binary loads TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ProxyConfig {
    /// Listen address, e.g. "127.0.0.1:9192".
    pub listen: Option<String>,

    /// Upstream broker address, e.g. "broker.example.com:9092".
    pub broker: Option<String>,

    /// Virtual cluster name reported to filters.
    pub cluster: Option<String>,

    /// Authenticate clients at the proxy before selecting an upstream.
    #[serde(default)]
    pub sasl_offload: bool,

    /// Bound on bytes buffered before the upstream connection is ready.
    pub max_buffered_bytes: Option<usize>,

    /// Bound on a single KRPC frame.
    pub max_frame_bytes: Option<usize>,

    pub tcp_nodelay: Option<bool>,

    /// Log per-direction byte counts.
    #[serde(default)]
    pub log_network: bool,

    /// Log every frame (implies decoding every frame).
    #[serde(default)]
    pub log_frames: bool,

    /// Ordered list of built-in filters.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

/// A built-in filter instance in the chain.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    /// Log every frame at debug level.
    FrameLog {},
    /// Short-circuit `CreateTopics` requests with an error.
    RejectCreateTopics { message: Option<String> },
}

impl FilterConfig {
    fn into_factory(self) -> Arc<dyn FilterFactory> {
        match self {
            FilterConfig::FrameLog {} => Arc::new(FrameLoggerFactory),
            FilterConfig::RejectCreateTopics { message } => {
                Arc::new(RejectCreateTopicsFactory { message })
            }
        }
    }
}

impl ProxyConfig {
    /// Load from a TOML file on disk.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Convert into a [`ProxyBuilder`] with everything but the listen
    /// address applied.
    pub fn into_builder(self) -> anyhow::Result<ProxyBuilder> {
        let broker: HostPort = self
            .broker
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("config is missing the broker address"))?
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid broker address: {e}"))?;

        let mut builder = crate::Proxy::builder()
            .target(broker)
            .sasl_offload(self.sasl_offload)
            .log_network(self.log_network)
            .log_frames(self.log_frames);
        if let Some(cluster) = self.cluster {
            builder = builder.cluster_name(cluster);
        }
        if let Some(bytes) = self.max_buffered_bytes {
            builder = builder.max_buffered_bytes(bytes);
        }
        if let Some(bytes) = self.max_frame_bytes {
            builder = builder.max_frame_bytes(bytes);
        }
        if let Some(nodelay) = self.tcp_nodelay {
            builder = builder.tcp_nodelay(nodelay);
        }
        for filter in self.filters {
            builder = builder.filter_arc(filter.into_factory());
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: ProxyConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:9192"
            broker = "broker.internal:9092"
            cluster = "prod"
            sasl_offload = true
            max_buffered_bytes = 524288
            log_frames = true

            [[filters]]
            type = "reject_create_topics"
            message = "ask the platform team"

            [[filters]]
            type = "frame_log"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:9192"));
        assert_eq!(config.broker.as_deref(), Some("broker.internal:9092"));
        assert!(config.sasl_offload);
        assert_eq!(config.max_buffered_bytes, Some(524288));
        assert_eq!(config.filters.len(), 2);
        config.into_builder().unwrap();
    }

    #[test]
    fn broker_is_required() {
        let config: ProxyConfig = toml::from_str(r#"listen = "127.0.0.1:9192""#).unwrap();
        assert!(config.into_builder().is_err());
    }

    #[test]
    fn defaults_are_off() {
        let config: ProxyConfig = toml::from_str(r#"broker = "b:9092""#).unwrap();
        assert!(!config.sasl_offload);
        assert!(!config.log_network);
        assert!(!config.log_frames);
        assert!(config.filters.is_empty());
    }
}
