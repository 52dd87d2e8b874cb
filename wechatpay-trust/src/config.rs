//! Client configuration loaded from TOML.
//!
//! ```toml
//! mchid = "1230000109"
//! appid = "wxd678efh567hg6787"
//! pay_type = "jsapi"
//! cert_serial_no = "444F4864EA9B34415"
//! private_key_path = "/etc/wechatpay/apiclient_key.pem"
//! apiv3_key_env = "WECHATPAY_APIV3_KEY"
//! notify_url = "https://example.com/notify"
//! cert_dir = "/var/lib/wechatpay/certs"
//!
//! [verification]
//! timestamp_tolerance_secs = 300
//!
//! [http]
//! timeout_secs = 15
//! ```

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use url::Url;

use crate::{
    crypto::{ApiV3Key, MerchantIdentity, parse_private_key},
    error::{Result, WechatPayError},
    transport::HttpConfig,
};

/// Production API host.
pub const DEFAULT_BASE_URL: &str = "https://api.mch.weixin.qq.com";

const MAX_RENEWAL_WINDOW_SECS: u64 = 30 * 86_400;

/// Payment product the merchant integrates; decides the client parameter set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WechatPayType {
    /// In-app browser (official account) payment.
    Jsapi,
    /// Native mobile app payment.
    App,
    /// Mobile web payment outside WeChat.
    H5,
    /// QR code payment.
    #[default]
    Native,
    /// Mini program payment.
    Miniprog,
}

impl WechatPayType {
    /// Lower-case name as used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jsapi => "jsapi",
            Self::App => "app",
            Self::H5 => "h5",
            Self::Native => "native",
            Self::Miniprog => "miniprog",
        }
    }
}

/// `[verification]` table: clock tolerance and certificate refresh timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerificationConfig {
    /// Accepted distance between a message timestamp and the local clock.
    #[serde(default = "default_timestamp_tolerance_secs")]
    pub timestamp_tolerance_secs: u64,

    /// Refresh once every certificate is this close to expiry.
    #[serde(default = "default_renewal_window_secs")]
    pub renewal_window_secs: u64,

    /// Bound on one certificate refresh.
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,

    /// Background refresh interval; `0` disables it.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_secs: default_timestamp_tolerance_secs(),
            renewal_window_secs: default_renewal_window_secs(),
            refresh_timeout_secs: default_refresh_timeout_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl VerificationConfig {
    /// Validates bounds.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] if:
    /// - `timestamp_tolerance_secs` is outside 1-3600
    /// - `refresh_timeout_secs` is outside 1-60
    /// - `refresh_interval_secs` is between 1 and 59
    /// - `renewal_window_secs` exceeds 30 days
    pub fn validate(&self) -> Result<()> {
        if !(1..=3600).contains(&self.timestamp_tolerance_secs) {
            return Err(WechatPayError::Config(
                "verification.timestamp_tolerance_secs must be between 1 and 3600".to_owned(),
            ));
        }
        if !(1..=60).contains(&self.refresh_timeout_secs) {
            return Err(WechatPayError::Config(
                "verification.refresh_timeout_secs must be between 1 and 60".to_owned(),
            ));
        }
        if self.renewal_window_secs > MAX_RENEWAL_WINDOW_SECS {
            return Err(WechatPayError::Config(
                "verification.renewal_window_secs must not exceed 30 days".to_owned(),
            ));
        }
        if (1..60).contains(&self.refresh_interval_secs) {
            return Err(WechatPayError::Config(
                "verification.refresh_interval_secs must be 0 or at least 60".to_owned(),
            ));
        }
        Ok(())
    }
}

const fn default_timestamp_tolerance_secs() -> u64 {
    300
}

const fn default_renewal_window_secs() -> u64 {
    86_400
}

const fn default_refresh_timeout_secs() -> u64 {
    15
}

const fn default_refresh_interval_secs() -> u64 {
    43_200
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}

/// Merchant client configuration.
#[derive(Clone, Deserialize)]
pub struct ClientConfig {
    /// Merchant id.
    pub mchid: String,
    /// Application id bound to the merchant.
    pub appid: String,
    /// Payment product.
    #[serde(default)]
    pub pay_type: WechatPayType,
    /// Serial number of the merchant API certificate.
    pub cert_serial_no: String,
    /// Inline private key (PEM or base64 DER).
    #[serde(default)]
    pub private_key: Option<String>,
    /// Path to the private key file.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Inline APIv3 key.
    #[serde(default)]
    pub apiv3_key: Option<String>,
    /// Environment variable holding the APIv3 key.
    #[serde(default)]
    pub apiv3_key_env: Option<String>,
    /// Default notification URL for orders.
    #[serde(default)]
    pub notify_url: Option<String>,
    /// Directory for persisted platform certificates.
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
    /// API host.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Verification settings.
    #[serde(default)]
    pub verification: VerificationConfig,
    /// HTTP transport settings.
    #[serde(default)]
    pub http: HttpConfig,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("mchid", &self.mchid)
            .field("appid", &self.appid)
            .field("pay_type", &self.pay_type)
            .field("cert_serial_no", &self.cert_serial_no)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("apiv3_key", &self.apiv3_key.as_ref().map(|_| "<redacted>"))
            .field("apiv3_key_env", &self.apiv3_key_env)
            .field("notify_url", &self.notify_url)
            .field("cert_dir", &self.cert_dir)
            .field("base_url", &self.base_url)
            .field("verification", &self.verification)
            .field("http", &self.http)
            .finish()
    }
}

impl ClientConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] on syntax errors or failed validation.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| WechatPayError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| WechatPayError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Checks every rule a client needs to start.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        self.identity()?;
        parse_private_key(&self.private_key_material()?)?;
        self.apiv3_key()?;
        require_https("base_url", &self.base_url)?;
        if let Some(notify_url) = &self.notify_url {
            require_https("notify_url", notify_url)?;
        }
        self.verification.validate()?;
        self.http.validate()
    }

    /// The merchant identity.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] for empty ids or a non-hex serial.
    pub fn identity(&self) -> Result<MerchantIdentity> {
        MerchantIdentity::new(&self.mchid, &self.appid, &self.cert_serial_no)
    }

    /// Private key text, inline or read from `private_key_path`.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] if neither is set or the file is unreadable.
    pub fn private_key_material(&self) -> Result<String> {
        match (&self.private_key, &self.private_key_path) {
            (Some(inline), _) if !inline.trim().is_empty() => Ok(inline.clone()),
            (_, Some(path)) => fs::read_to_string(path)
                .map_err(|e| WechatPayError::Config(format!("cannot read private key {}: {e}", path.display()))),
            _ => Err(WechatPayError::Config("private_key or private_key_path is required".to_owned())),
        }
    }

    /// The APIv3 key, inline or from the environment variable `apiv3_key_env`.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] if the key is missing or not 32 bytes.
    pub fn apiv3_key(&self) -> Result<ApiV3Key> {
        if let Some(inline) = &self.apiv3_key {
            return ApiV3Key::from_text(inline);
        }
        if let Some(var) = &self.apiv3_key_env {
            let value = std::env::var(var)
                .map_err(|_| WechatPayError::Config(format!("environment variable {var} is not set")))?;
            return ApiV3Key::from_text(&value);
        }
        Err(WechatPayError::Config("apiv3_key or apiv3_key_env is required".to_owned()))
    }
}

fn require_https(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).map_err(|e| WechatPayError::Config(format!("{field} is not a URL: {e}")))?;
    if url.scheme() != "https" {
        return Err(WechatPayError::Config(format!("{field} must use https")));
    }
    Ok(())
}
