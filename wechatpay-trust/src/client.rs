//! High-level merchant client.
//!
//! [`WechatPayClient`] wires the trust layer together: it signs every
//! outgoing request, verifies every answer and notification against the
//! platform certificate cache, and keeps that cache fresh.

use std::{sync::Arc, time::Duration};

use base64::Engine;
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::{
    certificates::{CertificateCache, CertificateRefresher, CertificateStore, RefreshOutcome},
    config::{ClientConfig, WechatPayType},
    crypto::{
        Authorization, HEADER_SERIAL, KeyStore, PayloadCipher, ResponseVerifier, Signer, generate_nonce,
    },
    error::{Result, WechatPayError},
    notify::{DecryptedNotification, NotificationHandler},
    reliability::{RetryPolicy, is_unsent, retry_with_backoff_if},
    transport::{ApiRequest, HttpTransport, Method, Transport},
};

/// A sensitive field encrypted for the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    /// Base64 RSA-OAEP ciphertext.
    pub ciphertext: String,
    /// Serial number of the platform certificate used; send it as `Wechatpay-Serial`.
    pub serial_no: String,
}

/// Merchant-side WeChat Pay APIv3 client.
///
/// # Examples
///
/// ```no_run
/// use wechatpay_trust::{ClientConfig, WechatPayClient, transport::Method};
///
/// # async fn example() -> wechatpay_trust::Result<()> {
/// let config = ClientConfig::from_file("/etc/wechatpay/client.toml")?;
/// let client = WechatPayClient::new(&config)?;
///
/// let body = client
///     .request(Method::Get, "/v3/pay/transactions/out-trade-no/1217752501201407033233368018?mchid=1230000109", b"")
///     .await?;
/// println!("{}", String::from_utf8_lossy(&body));
/// # Ok(())
/// # }
/// ```
pub struct WechatPayClient<T = HttpTransport> {
    appid: String,
    pay_type: WechatPayType,
    base_url: String,
    refresh_interval: Duration,
    signer: Signer,
    transport: Arc<T>,
    refresher: Arc<CertificateRefresher<T>>,
    verifier: Arc<ResponseVerifier<T>>,
    notifications: NotificationHandler<T>,
    retry_policy: RetryPolicy,
}

impl<T> std::fmt::Debug for WechatPayClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WechatPayClient")
            .field("mchid", &self.signer.keys().identity().mchid())
            .field("appid", &self.appid)
            .field("pay_type", &self.pay_type)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WechatPayClient<HttpTransport> {
    /// Creates a client talking HTTPS through [`HttpTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] for invalid configuration,
    /// [`WechatPayError::Http`] if the HTTP client cannot be built and
    /// [`WechatPayError::Io`] if the certificate directory cannot be read.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let transport = HttpTransport::with_config(&config.http)?;
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> WechatPayClient<T> {
    /// Creates a client over a custom transport.
    ///
    /// Certificates persisted in `cert_dir` are loaded into the cache; expired
    /// ones are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] for invalid configuration and
    /// [`WechatPayError::Io`] if the certificate directory cannot be read.
    pub fn with_transport(config: &ClientConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let verification = &config.verification;

        let keys = Arc::new(KeyStore::from_pem(config.identity()?, &config.private_key_material()?)?);
        let signer = Signer::new(keys);
        let cipher = Arc::new(PayloadCipher::new(&config.apiv3_key()?));

        let renewal_window = i64::try_from(verification.renewal_window_secs)
            .map_err(|_| WechatPayError::Config("renewal_window_secs out of range".to_owned()))?;
        let cache = Arc::new(CertificateCache::new(chrono::Duration::seconds(renewal_window)));
        let transport = Arc::new(transport);

        let mut refresher = CertificateRefresher::new(
            Arc::clone(&transport),
            signer.clone(),
            Arc::clone(&cipher),
            Arc::clone(&cache),
            config.base_url.clone(),
        )
        .with_timeout(Duration::from_secs(verification.refresh_timeout_secs))
        .with_timestamp_tolerance(verification.timestamp_tolerance_secs);

        if let Some(dir) = &config.cert_dir {
            let store = CertificateStore::new(dir);
            let persisted = store.load(Utc::now())?;
            if !persisted.is_empty() {
                info!(count = persisted.len(), dir = %dir.display(), "loaded persisted platform certificates");
                cache.replace_all(persisted);
            }
            refresher = refresher.with_store(store);
        }

        let refresher = Arc::new(refresher);
        let verifier = Arc::new(ResponseVerifier::new(Arc::clone(&refresher), verification.timestamp_tolerance_secs));
        let notifications = NotificationHandler::new(Arc::clone(&verifier), cipher, config.mchid.clone());

        Ok(Self {
            appid: config.appid.clone(),
            pay_type: config.pay_type,
            base_url: config.base_url.clone(),
            refresh_interval: Duration::from_secs(verification.refresh_interval_secs),
            signer,
            transport,
            refresher,
            verifier,
            notifications,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Replaces the backoff used when [`request`](Self::request) cannot connect.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// The platform certificate cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<CertificateCache> {
        self.refresher.cache()
    }

    /// The certificate refresher.
    #[must_use]
    pub const fn refresher(&self) -> &Arc<CertificateRefresher<T>> {
        &self.refresher
    }

    /// The response verifier.
    #[must_use]
    pub const fn verifier(&self) -> &Arc<ResponseVerifier<T>> {
        &self.verifier
    }

    /// The request signer.
    #[must_use]
    pub const fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Signs arbitrary fields in canonical form, base64 encoded.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Signing`] if the RSA primitive fails.
    pub fn sign<S: AsRef<str>>(&self, fields: &[S]) -> Result<String> {
        self.signer.sign_to_base64(fields)
    }

    /// Builds the `Authorization` header for a request.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Signing`] if the RSA primitive fails.
    pub fn authorization(&self, method: Method, path: &str, body: &[u8]) -> Result<Authorization> {
        self.signer.authorize(method.as_str(), path, body)
    }

    /// Sends a signed request and returns the verified response body.
    ///
    /// `path` is the absolute path plus query string. Only connection
    /// failures are retried with backoff. Once the platform has answered, the
    /// request is never sent again, even if the answer cannot be verified.
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::Platform`] for a non-2xx answer
    /// - any [`ResponseVerifier::verify`] error if the answer does not verify,
    ///   including [`WechatPayError::Refresh`] when the certificate set could
    ///   not be fetched; check the operation's state before repeating it
    /// - [`WechatPayError::Http`] when the request failed or retries are exhausted
    #[instrument(skip(self, body))]
    pub async fn request(&self, method: Method, path: &str, body: &[u8]) -> Result<Vec<u8>> {
        self.send(method, path, body, None).await
    }

    /// Like [`request`](Self::request), announcing the platform certificate
    /// used for [`encrypt_sensitive`](Self::encrypt_sensitive) fields in the body.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    #[instrument(skip(self, body))]
    pub async fn request_with_serial(
        &self,
        method: Method,
        path: &str,
        body: &[u8],
        platform_serial: &str,
    ) -> Result<Vec<u8>> {
        self.send(method, path, body, Some(platform_serial)).await
    }

    async fn send(&self, method: Method, path: &str, body: &[u8], platform_serial: Option<&str>) -> Result<Vec<u8>> {
        let authorization = self.authorization(method, path, body)?;
        let mut request = ApiRequest::new(method, self.base_url.clone(), path)
            .header("Authorization", authorization.header)
            .body(body.to_vec());
        if let Some(serial) = platform_serial {
            request = request.header(HEADER_SERIAL, serial);
        }

        let response =
            retry_with_backoff_if(&self.retry_policy, is_unsent, || self.transport.execute(request.clone())).await?;
        if !response.is_success() {
            return Err(WechatPayError::Platform {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }

        self.verifier.verify_response(&response).await?;
        Ok(response.body)
    }

    /// Verifies a webhook notification and returns its decrypted resource.
    ///
    /// # Errors
    ///
    /// See [`NotificationHandler::open`].
    pub async fn decrypt_callback<I, K, V>(&self, headers: I, body: &[u8]) -> Result<serde_json::Value>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Ok(self.notifications.open(headers, body).await?.resource)
    }

    /// Like [`decrypt_callback`](Self::decrypt_callback), keeping the outer fields.
    ///
    /// # Errors
    ///
    /// See [`NotificationHandler::open`].
    pub async fn open_notification<I, K, V>(&self, headers: I, body: &[u8]) -> Result<DecryptedNotification>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.notifications.open(headers, body).await
    }

    /// Decrypts a sensitive field the platform encrypted for this merchant.
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::InvalidInput`] if the input is not base64 or the
    ///   plaintext is not UTF-8
    /// - [`WechatPayError::Authentication`] if RSA-OAEP decryption fails
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| WechatPayError::InvalidInput(format!("ciphertext is not base64: {e}")))?;
        let plaintext = self.signer.keys().decrypt_oaep(&raw)?;
        String::from_utf8(plaintext)
            .map_err(|_| WechatPayError::InvalidInput("decrypted field is not UTF-8".to_owned()))
    }

    /// Encrypts a sensitive field with the newest trusted platform certificate.
    ///
    /// Refreshes the certificate set first if no valid certificate is cached.
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::UnknownCertificate`] if no valid certificate exists
    ///   even after a refresh
    /// - refresh errors, see [`CertificateRefresher::refresh`]
    pub async fn encrypt_sensitive(&self, plaintext: &str) -> Result<EncryptedField> {
        let certificate = match self.cache().newest(Utc::now()) {
            Some(certificate) => certificate,
            None => {
                self.refresher.refresh().await?;
                self.cache()
                    .newest(Utc::now())
                    .ok_or_else(|| WechatPayError::UnknownCertificate("no valid platform certificate".to_owned()))?
            }
        };

        let ciphertext = certificate.encrypt_oaep(plaintext.as_bytes())?;
        Ok(EncryptedField {
            ciphertext: base64::engine::general_purpose::STANDARD.encode(ciphertext),
            serial_no: certificate.serial_no().to_owned(),
        })
    }

    /// Fetches and installs the current platform certificate set.
    ///
    /// # Errors
    ///
    /// See [`CertificateRefresher::refresh`].
    pub async fn refresh_certificates(&self) -> Result<RefreshOutcome> {
        self.refresher.refresh().await
    }

    /// Starts the background refresh task, unless `refresh_interval_secs` is `0`.
    ///
    /// Must be called from within a tokio runtime. Dropping the handle leaves
    /// the task running; abort it to stop refreshing.
    #[must_use]
    pub fn spawn_refresh(&self) -> Option<JoinHandle<()>>
    where
        T: 'static,
    {
        (!self.refresh_interval.is_zero()).then(|| self.refresher.spawn_periodic(self.refresh_interval))
    }

    /// Client-side payment parameters for `prepay_id`, signed with `paySign`.
    ///
    /// JSAPI and mini program payments sign `appId`, `timeStamp`, `nonceStr`
    /// and `package`; app payments sign `appid`, `timestamp`, `noncestr` and
    /// `prepayid`.
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::InvalidInput`] for H5 and native payments, which
    ///   have no client-side parameters
    /// - [`WechatPayError::Signing`] if the RSA primitive fails
    pub fn pay_params(&self, prepay_id: &str) -> Result<serde_json::Value> {
        let timestamp = Utc::now().timestamp().to_string();
        let nonce = generate_nonce();

        match self.pay_type {
            WechatPayType::Jsapi | WechatPayType::Miniprog => {
                let package = format!("prepay_id={prepay_id}");
                let pay_sign = self.signer.pay_sign(&self.appid, &timestamp, &nonce, &package)?;
                Ok(json!({
                    "appId": self.appid,
                    "timeStamp": timestamp,
                    "nonceStr": nonce,
                    "package": package,
                    "signType": "RSA",
                    "paySign": pay_sign,
                }))
            }
            WechatPayType::App => {
                let sign = self.signer.sign_to_base64(&[self.appid.as_str(), &timestamp, &nonce, prepay_id])?;
                Ok(json!({
                    "appid": self.appid,
                    "partnerid": self.signer.keys().identity().mchid(),
                    "prepayid": prepay_id,
                    "package": "Sign=WXPay",
                    "noncestr": nonce,
                    "timestamp": timestamp,
                    "sign": sign,
                }))
            }
            other @ (WechatPayType::H5 | WechatPayType::Native) => Err(WechatPayError::InvalidInput(format!(
                "{} payments have no client-side parameters",
                other.as_str()
            ))),
        }
    }
}
