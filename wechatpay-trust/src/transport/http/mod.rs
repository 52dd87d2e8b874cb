//! HTTP transport implementation on reqwest.

use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use super::config::{HttpConfig, HttpVersion};
use crate::{
    error::{Result, WechatPayError},
    transport::{ApiRequest, ApiResponse, Method, Transport},
};

/// Identifies this client to the platform.
const USER_AGENT: &str = concat!("wechatpay-trust/", env!("CARGO_PKG_VERSION"));

/// Validates URL for security constraints.
///
/// Ensures the URL uses HTTPS and does not point to localhost.
fn validate_url(url: &Url) -> Result<()> {
    if url.scheme() != "https" {
        return Err(WechatPayError::InvalidInput("Only HTTPS URLs are allowed".to_owned()));
    }

    if let Some(host) = url.host_str()
        && (host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "[::1]")
    {
        return Err(WechatPayError::InvalidInput("Localhost URLs are not allowed".to_owned()));
    }

    Ok(())
}

/// Rejects paths containing directory traversal sequences.
fn sanitize_path(path: &str) -> Result<&str> {
    if path.contains("..") || path.contains("//") {
        return Err(WechatPayError::InvalidInput(
            "Invalid path: traversal sequences not allowed".to_owned(),
        ));
    }
    if !path.starts_with('/') {
        return Err(WechatPayError::InvalidInput("Path must start with '/'".to_owned()));
    }
    Ok(path)
}

/// Validates header name and value for CRLF injection prevention.
fn validate_header(name: &str, value: &str) -> Result<()> {
    if name.contains('\r') || name.contains('\n') || name.contains('\0') {
        return Err(WechatPayError::InvalidInput(
            "Invalid header name: control characters not allowed".to_owned(),
        ));
    }
    if value.contains('\r') || value.contains('\n') || value.contains('\0') {
        return Err(WechatPayError::InvalidInput(
            "Invalid header value: control characters not allowed".to_owned(),
        ));
    }
    Ok(())
}

/// HTTP/1.1 and HTTP/2 transport using reqwest.
///
/// Connection pooling and keep-alive come from the shared `reqwest::Client`;
/// every call is bounded by the configured request timeout.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::transport::{HttpConfig, HttpTransport, HttpVersion, Transport};
///
/// let config = HttpConfig { timeout_secs: 20, http_version: HttpVersion::Http1, ..Default::default() };
/// let transport = HttpTransport::with_config(&config)?;
/// assert_eq!(transport.protocol_name(), "http/1.1");
/// # Ok::<(), wechatpay_trust::WechatPayError>(())
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    http_version: HttpVersion,
}

impl HttpTransport {
    /// Creates a transport with [`HttpConfig::default`].
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Http`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        Self::with_config(&HttpConfig::default())
    }

    /// Creates a transport with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Http`] if client creation fails.
    pub fn with_config(config: &HttpConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout());

        builder = match config.http_version {
            HttpVersion::Http1 => builder.http1_only(),
            HttpVersion::Http2 => builder.http2_prior_knowledge(),
            HttpVersion::Auto => builder,
        };

        let client = builder.build()?;

        Ok(Self { client, http_version: config.http_version })
    }

    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = Url::parse(&request.base_url)
            .map_err(|e| WechatPayError::InvalidInput(format!("invalid base_url: {e}")))?;
        validate_url(&url)?;
        let path = sanitize_path(&request.path)?;
        for (name, value) in &request.headers {
            validate_header(name, value)?;
        }

        let full_url = format!("{}{path}", request.base_url.trim_end_matches('/'));
        let mut builder = match request.method {
            Method::Get => self.client.get(&full_url),
            Method::Post => self.client.post(&full_url),
            Method::Put => self.client.put(&full_url),
            Method::Patch => self.client.patch(&full_url),
            Method::Delete => self.client.delete(&full_url),
        };

        builder = builder.header("Accept", "application/json");
        if !request.body.is_empty() {
            builder = builder.header("Content-Type", "application/json");
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_owned(), v.to_owned())))
            .collect();
        let body = response.bytes().await?.to_vec();

        debug!(status, body_len = body.len(), "platform responded");
        Ok(ApiResponse::new(status, headers, body))
    }
}

impl Transport for HttpTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.send(request).await
    }

    fn protocol_name(&self) -> &'static str {
        match self.http_version {
            HttpVersion::Http1 => "http/1.1",
            HttpVersion::Http2 => "http/2",
            HttpVersion::Auto => "http",
        }
    }
}
