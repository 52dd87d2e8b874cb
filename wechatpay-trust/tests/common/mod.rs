//! Shared fixtures: an in-memory platform that signs like the real one.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::{
    RsaPrivateKey,
    pkcs1v15::SigningKey,
    pkcs8::DecodePrivateKey,
    signature::{SignatureEncoding, Signer as _},
};
use serde_json::{Value, json};
use sha2::Sha256;
use wechatpay_trust::{
    ClientConfig, Result, WechatPayClient,
    certificates::CERTIFICATES_PATH,
    crypto::{ApiV3Key, EncryptedBlock, PayloadCipher, generate_nonce},
    reliability::RetryPolicy,
    transport::{ApiRequest, ApiResponse, Transport},
};

pub const MERCHANT_KEY: &str = include_str!("../fixtures/merchant_key.pem");
pub const MERCHANT_PUBLIC_KEY: &str = include_str!("../fixtures/merchant_public_key.pem");
pub const PLATFORM_KEY: &str = include_str!("../fixtures/platform_key.pem");
pub const PLATFORM_CERT: &str = include_str!("../fixtures/platform_cert.pem");
pub const ROGUE_KEY: &str = include_str!("../fixtures/rogue_key.pem");
pub const ROGUE_CERT: &str = include_str!("../fixtures/rogue_cert.pem");

pub const PLATFORM_SERIAL: &str = "5157F09EFDC096DE15EBE81A47057A7232F1B8E1";
pub const ROGUE_SERIAL: &str = "7E2A9C1B44D08F3A6B15C2E9D07F4A8B3C6E1D20";

pub const MCHID: &str = "1230000109";
pub const APPID: &str = "wxd678efh567hg6787";
pub const MERCHANT_SERIAL: &str = "444F4864EA9B34415";
pub const APIV3_KEY: &str = "0123456789abcdef0123456789abcdef";

/// How the mock answers `GET /v3/certificates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingMode {
    /// Genuine certificate, signed with the genuine key.
    Genuine,
    /// Rogue certificate, signed with the rogue key under its own serial.
    Forged,
    /// Genuine certificate and serial, signed with the rogue key.
    Impersonated,
    /// 503 with no signature.
    Unavailable,
}

struct Party {
    key: SigningKey<Sha256>,
    serial: &'static str,
    pem: &'static str,
}

impl Party {
    fn new(key_pem: &str, serial: &'static str, pem: &'static str) -> Self {
        let key = RsaPrivateKey::from_pkcs8_pem(key_pem).expect("fixture key must parse");
        Self { key: SigningKey::new(key), serial, pem }
    }
}

struct State {
    genuine: Party,
    rogue: Party,
    cipher: PayloadCipher,
    mode: Mutex<ListingMode>,
    delay: Mutex<Duration>,
    certificate_fetches: AtomicUsize,
    requests: Mutex<Vec<ApiRequest>>,
}

/// Plays the platform: serves the certificate listing and signs every answer.
#[derive(Clone)]
pub struct MockPlatform {
    state: Arc<State>,
}

impl std::fmt::Debug for MockPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPlatform").field("fetches", &self.certificate_fetches()).finish_non_exhaustive()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        let key = ApiV3Key::from_text(APIV3_KEY).expect("fixture APIv3 key is 32 bytes");
        Self {
            state: Arc::new(State {
                genuine: Party::new(PLATFORM_KEY, PLATFORM_SERIAL, PLATFORM_CERT),
                rogue: Party::new(ROGUE_KEY, ROGUE_SERIAL, ROGUE_CERT),
                cipher: PayloadCipher::new(&key),
                mode: Mutex::new(ListingMode::Genuine),
                delay: Mutex::new(Duration::ZERO),
                certificate_fetches: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_mode(&self, mode: ListingMode) {
        *self.state.mode.lock().unwrap() = mode;
    }

    /// Delays every certificate listing answer.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn certificate_fetches(&self) -> usize {
        self.state.certificate_fetches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Encrypts a webhook resource the way the platform does.
    pub fn encrypt_resource(&self, resource: &Value) -> EncryptedBlock {
        let mut block = self
            .state
            .cipher
            .encrypt(b"transaction", resource.to_string().as_bytes())
            .expect("encryption with a valid key succeeds");
        block.original_type = Some("transaction".to_owned());
        block
    }

    /// A genuine, signed, current notification carrying `resource`.
    pub fn webhook(&self, resource: &Value) -> (Vec<(String, String)>, Vec<u8>) {
        self.webhook_at(resource, Utc::now().timestamp())
    }

    /// A genuine notification signed with the given timestamp.
    pub fn webhook_at(&self, resource: &Value, timestamp: i64) -> (Vec<(String, String)>, Vec<u8>) {
        let body = notification_body(&self.encrypt_resource(resource));
        let headers = sign_headers(&self.state.genuine, self.state.genuine.serial, timestamp, &body);
        (headers, body)
    }

    /// Signs an arbitrary body as the genuine platform.
    pub fn sign_genuine(&self, body: &[u8]) -> Vec<(String, String)> {
        sign_headers(&self.state.genuine, self.state.genuine.serial, Utc::now().timestamp(), body)
    }

    /// Signs an arbitrary body with the rogue key under the rogue serial.
    pub fn sign_rogue(&self, body: &[u8]) -> Vec<(String, String)> {
        sign_headers(&self.state.rogue, self.state.rogue.serial, Utc::now().timestamp(), body)
    }

    fn signed(&self, party: &Party, header_serial: &str, body: Vec<u8>) -> ApiResponse {
        let mut headers = sign_headers(party, header_serial, Utc::now().timestamp(), &body);
        headers.push(("Content-Type".to_owned(), "application/json".to_owned()));
        ApiResponse::new(200, headers, body)
    }

    fn listing(&self, party: &Party) -> Vec<u8> {
        let now = Utc::now();
        let block = self
            .state
            .cipher
            .encrypt(b"certificate", party.pem.as_bytes())
            .expect("encryption with a valid key succeeds");
        json!({
            "data": [{
                "serial_no": party.serial,
                "effective_time": rfc3339(now - chrono::Duration::days(1)),
                "expire_time": rfc3339(now + chrono::Duration::days(365)),
                "encrypt_certificate": block,
            }]
        })
        .to_string()
        .into_bytes()
    }

    async fn certificates(&self) -> ApiResponse {
        self.state.certificate_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mode = *self.state.mode.lock().unwrap();
        let (genuine, rogue) = (&self.state.genuine, &self.state.rogue);
        match mode {
            ListingMode::Genuine => self.signed(genuine, genuine.serial, self.listing(genuine)),
            ListingMode::Forged => self.signed(rogue, rogue.serial, self.listing(rogue)),
            ListingMode::Impersonated => self.signed(rogue, genuine.serial, self.listing(genuine)),
            ListingMode::Unavailable => {
                ApiResponse::new(503, Vec::new(), br#"{"code":"SYSTEM_ERROR","message":"busy"}"#.to_vec())
            }
        }
    }
}

impl Transport for MockPlatform {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.state.requests.lock().unwrap().push(request.clone());

        if request.path == CERTIFICATES_PATH {
            return Ok(self.certificates().await);
        }
        if request.path.starts_with("/v3/missing") {
            return Ok(ApiResponse::new(
                404,
                Vec::new(),
                br#"{"code":"RESOURCE_NOT_EXISTS","message":"order not found"}"#.to_vec(),
            ));
        }

        let body = json!({ "method": request.method.as_str(), "path": request.path }).to_string().into_bytes();
        let genuine = &self.state.genuine;
        let mut response = self.signed(genuine, genuine.serial, body);
        if request.path.starts_with("/v3/tampered") {
            response.body = br#"{"trade_state":"SUCCESS"}"#.to_vec();
        }
        Ok(response)
    }

    fn protocol_name(&self) -> &'static str {
        "mock"
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn sign_headers(party: &Party, header_serial: &str, timestamp: i64, body: &[u8]) -> Vec<(String, String)> {
    let nonce = generate_nonce();
    let mut message = format!("{timestamp}\n{nonce}\n").into_bytes();
    message.extend_from_slice(body);
    message.push(b'\n');
    let signature = base64::engine::general_purpose::STANDARD.encode(party.key.sign(&message).to_vec());

    vec![
        ("Wechatpay-Timestamp".to_owned(), timestamp.to_string()),
        ("Wechatpay-Nonce".to_owned(), nonce),
        ("Wechatpay-Signature".to_owned(), signature),
        ("Wechatpay-Serial".to_owned(), header_serial.to_owned()),
    ]
}

/// The outer notification JSON around an encrypted resource.
pub fn notification_body(resource: &EncryptedBlock) -> Vec<u8> {
    json!({
        "id": "EV-2018022511223320873",
        "create_time": "2015-05-20T13:29:35+08:00",
        "event_type": "TRANSACTION.SUCCESS",
        "resource_type": "encrypt-resource",
        "resource": resource,
        "summary": "payment succeeded",
    })
    .to_string()
    .into_bytes()
}

/// Configuration for the fixture merchant; `extra` is appended verbatim.
pub fn config(extra: &str) -> ClientConfig {
    let text = format!(
        "mchid = \"{MCHID}\"\n\
         appid = \"{APPID}\"\n\
         cert_serial_no = \"{MERCHANT_SERIAL}\"\n\
         apiv3_key = \"{APIV3_KEY}\"\n\
         private_key = '''\n{MERCHANT_KEY}'''\n\
         {extra}"
    );
    ClientConfig::from_toml(&text).expect("fixture configuration is valid")
}

/// A client over `platform` that does not retry.
pub fn client(platform: &MockPlatform, extra: &str) -> WechatPayClient<MockPlatform> {
    WechatPayClient::with_transport(&config(extra), platform.clone())
        .expect("client construction succeeds")
        .with_retry_policy(RetryPolicy::with_max_attempts(1))
}

/// Sample transaction resource.
pub fn transaction() -> Value {
    json!({
        "mchid": MCHID,
        "appid": APPID,
        "out_trade_no": "1217752501201407033233368018",
        "transaction_id": "1217752501201407033233368018",
        "trade_state": "SUCCESS",
        "amount": { "total": 100, "currency": "CNY" },
    })
}
