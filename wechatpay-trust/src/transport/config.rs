//! HTTP transport configuration.
//!
//! Deserialised from the `[http]` table of the client configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WechatPayError};

/// HTTP transport configuration.
///
/// # Examples
///
/// ```toml
/// [http]
/// timeout_secs = 15
/// connect_timeout_secs = 10
/// pool_max_idle_per_host = 16
/// http_version = "auto"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HttpConfig {
    /// Maximum idle connections per host.
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// HTTP version preference.
    #[serde(default)]
    pub http_version: HttpVersion,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_max_idle(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            http_version: HttpVersion::default(),
        }
    }
}

impl HttpConfig {
    /// Validates configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] if timeout values are outside valid ranges:
    /// - `timeout_secs`: must be 1-300 seconds
    /// - `connect_timeout_secs`: must be 1-60 seconds
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.timeout_secs > 300 {
            return Err(WechatPayError::Config("http.timeout_secs must be between 1 and 300".to_owned()));
        }
        if self.connect_timeout_secs == 0 || self.connect_timeout_secs > 60 {
            return Err(WechatPayError::Config(
                "http.connect_timeout_secs must be between 1 and 60".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns timeout as Duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns connect timeout as Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// HTTP version preference.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HttpVersion {
    /// HTTP/1.1 only.
    Http1,
    /// HTTP/2 only (prior knowledge).
    Http2,
    /// Negotiate via ALPN.
    #[default]
    Auto,
}

const fn default_pool_max_idle() -> usize {
    16
}

const fn default_timeout_secs() -> u64 {
    15
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_default() {
        let config = HttpConfig::default();
        assert_eq!(config.pool_max_idle_per_host, 16);
        assert_eq!(config.timeout_secs, 15);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.http_version, HttpVersion::Auto);
        assert_eq!(config.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_http_config_from_toml() {
        let toml = "
            pool_max_idle_per_host = 20
            timeout_secs = 45
            connect_timeout_secs = 15
            http_version = \"http2\"
        ";

        let config: HttpConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.pool_max_idle_per_host, 20);
        assert_eq!(config.timeout_secs, 45);
        assert_eq!(config.connect_timeout_secs, 15);
        assert_eq!(config.http_version, HttpVersion::Http2);
    }

    #[test]
    fn test_http_config_with_defaults() {
        let config: HttpConfig = toml::from_str("timeout_secs = 60").unwrap();
        assert_eq!(config.pool_max_idle_per_host, 16);
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.http_version, HttpVersion::Auto);
    }

    #[test]
    fn test_http_version_rejects_unknown() {
        let result: std::result::Result<HttpConfig, _> = toml::from_str("http_version = \"http3\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_http_config_validate_bounds() {
        assert!(HttpConfig::default().validate().is_ok());
        assert!(HttpConfig { timeout_secs: 1, connect_timeout_secs: 1, ..Default::default() }.validate().is_ok());
        assert!(
            HttpConfig { timeout_secs: 300, connect_timeout_secs: 60, ..Default::default() }.validate().is_ok()
        );
    }

    #[test]
    fn test_http_config_validate_rejects_out_of_range() {
        for config in [
            HttpConfig { timeout_secs: 0, ..Default::default() },
            HttpConfig { timeout_secs: 301, ..Default::default() },
            HttpConfig { connect_timeout_secs: 0, ..Default::default() },
            HttpConfig { connect_timeout_secs: 61, ..Default::default() },
        ] {
            assert!(matches!(config.validate(), Err(WechatPayError::Config(_))));
        }
    }
}
