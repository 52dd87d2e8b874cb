//! Transport abstraction between the trust layer and the network.
//!
//! The trust layer builds fully signed [`ApiRequest`]s and receives whole
//! [`ApiResponse`]s back; everything in between (TLS, pooling, timeouts) is
//! the transport's business. [`HttpTransport`] is the production
//! implementation. Tests and embedders can supply their own.
//!
//! # Examples
//!
//! ```rust,no_run
//! use wechatpay_trust::transport::{ApiRequest, HttpTransport, Method, Transport};
//!
//! # async fn example() -> wechatpay_trust::Result<()> {
//! let transport = HttpTransport::new()?;
//! let request = ApiRequest::new(Method::Get, "https://api.mch.weixin.qq.com", "/v3/certificates")
//!     .header("Authorization", "WECHATPAY2-SHA256-RSA2048 ...");
//!
//! let response = transport.execute(request).await?;
//! println!("Status: {}", response.status);
//! # Ok(())
//! # }
//! ```

#[allow(
    redundant_imports,
    reason = "Future needed for RPITIT despite being in Edition 2024 prelude"
)]
use std::future::Future;
use std::{fmt, str::FromStr};

use crate::error::{Result, WechatPayError};

pub mod config;
pub mod http;

pub use config::{HttpConfig, HttpVersion};
pub use http::HttpTransport;

/// HTTP methods used by APIv3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl Method {
    /// Upper-case method name, exactly as it enters the signed message.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = WechatPayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(WechatPayError::InvalidInput(format!("unsupported HTTP method: {s}"))),
        }
    }
}

/// A request ready to be sent. Signing has already happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Scheme and authority, e.g. `https://api.mch.weixin.qq.com`.
    pub base_url: String,
    /// Absolute path plus query string; the same string that was signed.
    pub path: String,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Request body, empty for `GET`.
    pub body: Vec<u8>,
}

impl ApiRequest {
    /// Creates a request without headers or body.
    #[must_use]
    pub fn new(method: Method, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self { method, base_url: base_url.into(), path: path.into(), headers: Vec::new(), body: Vec::new() }
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// A whole response: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lower-cased.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Creates a response, lower-casing header names.
    #[must_use]
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        let headers = headers.into_iter().map(|(name, value)| (name.to_ascii_lowercase(), value)).collect();
        Self { status, headers, body }
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `true` for 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Sends signed requests to the platform.
///
/// Implementations must bound every call with a timeout and must not
/// interpret non-2xx statuses: those are returned as ordinary responses.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::{
///     Result,
///     transport::{ApiRequest, ApiResponse, Transport},
/// };
///
/// #[derive(Debug)]
/// struct Offline;
///
/// impl Transport for Offline {
///     async fn execute(&self, _request: ApiRequest) -> Result<ApiResponse> {
///         Ok(ApiResponse::new(503, Vec::new(), b"offline".to_vec()))
///     }
///
///     fn protocol_name(&self) -> &'static str {
///         "offline"
///     }
/// }
/// ```
pub trait Transport: Send + Sync {
    /// Sends the request and returns the complete response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or the response cannot
    /// be read. A non-2xx status is not an error at this layer.
    fn execute(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send;

    /// Protocol name for logging.
    fn protocol_name(&self) -> &'static str;
}
