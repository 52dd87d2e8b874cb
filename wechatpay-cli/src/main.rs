//! `wechatpay`: operator tool for the WeChat Pay APIv3 trust layer.
//!
//! Loads a client configuration file and exposes signing, certificate
//! refresh and decryption for scripting and diagnostics. Results go to
//! stdout, logs to stderr.

#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from rsa and reqwest"
)]

mod observability;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use observability::{LogFormat, init_observability};
use wechatpay_trust::{ClientConfig, WechatPayClient, transport::Method};

#[derive(Parser)]
#[command(name = "wechatpay")]
#[command(about = "WeChat Pay APIv3 signing, certificate and callback tool", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Client configuration file (TOML)
    #[arg(short, long, global = true, default_value = "wechatpay.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign fields in canonical form and print the base64 signature
    Sign {
        /// Fields in signing order, e.g. appId timeStamp nonceStr package
        #[arg(required = true)]
        fields: Vec<String>,
    },

    /// Print the Authorization header for a request
    Authorize {
        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Absolute path plus query string
        path: String,

        /// File holding the request body
        #[arg(long)]
        body: Option<PathBuf>,
    },

    /// Send a signed request and print the verified response body
    Request {
        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Absolute path plus query string
        path: String,

        /// File holding the request body
        #[arg(long)]
        body: Option<PathBuf>,
    },

    /// Refresh platform certificates and list the trusted set
    Certificates,

    /// Verify a webhook notification and print its decrypted resource
    DecryptCallback {
        /// JSON object with the callback headers
        #[arg(long)]
        headers: PathBuf,

        /// File holding the raw callback body
        #[arg(long)]
        body: PathBuf,
    },

    /// Decrypt a sensitive field encrypted for the merchant key
    Decrypt {
        /// Base64 ciphertext
        ciphertext: String,
    },

    /// Encrypt a sensitive field for the platform
    Encrypt {
        /// Plaintext value
        plaintext: String,
    },

    /// Print signed client-side payment parameters
    PayParams {
        /// Prepay id returned by the order API
        prepay_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_observability(LogFormat::from_env(), cli.verbose);

    let config = ClientConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let client = WechatPayClient::new(&config).context("failed to create client")?;

    match cli.command {
        Commands::Sign { fields } => {
            println!("{}", client.sign(&fields)?);
        }
        Commands::Authorize { method, path, body } => {
            let body = read_optional(body.as_deref()).await?;
            let authorization = client.authorization(method.parse::<Method>()?, &path, &body)?;
            println!("{}", authorization.header);
        }
        Commands::Request { method, path, body } => {
            let body = read_optional(body.as_deref()).await?;
            let answer = client.request(method.parse::<Method>()?, &path, &body).await?;
            println!("{}", String::from_utf8_lossy(&answer));
        }
        Commands::Certificates => {
            let outcome = client.refresh_certificates().await?;
            tracing::info!(?outcome, "certificate refresh finished");
            for certificate in client.cache().snapshot() {
                println!(
                    "{}  {}  {}",
                    certificate.serial_no(),
                    certificate.not_before().to_rfc3339(),
                    certificate.not_after().to_rfc3339()
                );
            }
        }
        Commands::DecryptCallback { headers, body } => {
            let headers = read_headers(&headers).await?;
            let body = tokio::fs::read(&body)
                .await
                .with_context(|| format!("failed to read {}", body.display()))?;
            let resource = client.decrypt_callback(headers, &body).await?;
            println!("{}", serde_json::to_string_pretty(&resource)?);
        }
        Commands::Decrypt { ciphertext } => {
            println!("{}", client.decrypt(&ciphertext)?);
        }
        Commands::Encrypt { plaintext } => {
            let field = client.encrypt_sensitive(&plaintext).await?;
            println!("{}", serde_json::json!({ "ciphertext": field.ciphertext, "serial_no": field.serial_no }));
        }
        Commands::PayParams { prepay_id } => {
            println!("{}", serde_json::to_string_pretty(&client.pay_params(&prepay_id)?)?);
        }
    }

    Ok(())
}

async fn read_optional(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display())),
        None => Ok(Vec::new()),
    }
}

/// Reads `{"Header-Name": "value", ...}`; non-string values are used as JSON text.
async fn read_headers(path: &Path) -> Result<Vec<(String, String)>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&raw).context("headers file must be a JSON object")?;

    Ok(object
        .into_iter()
        .map(|(name, value)| {
            let value = value.as_str().map_or_else(|| value.to_string(), str::to_owned);
            (name, value)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_decrypt_callback() {
        let cli = Cli::try_parse_from([
            "wechatpay",
            "--config",
            "/etc/wechatpay/client.toml",
            "decrypt-callback",
            "--headers",
            "headers.json",
            "--body",
            "body.json",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/wechatpay/client.toml"));
        assert!(matches!(cli.command, Commands::DecryptCallback { .. }));
    }

    #[test]
    fn test_sign_requires_fields() {
        assert!(Cli::try_parse_from(["wechatpay", "sign"]).is_err());
    }

    #[tokio::test]
    async fn test_read_headers_accepts_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.json");
        std::fs::write(&path, r#"{"Wechatpay-Timestamp": 1554208460, "Wechatpay-Nonce": "abc"}"#).unwrap();

        let headers = read_headers(&path).await.unwrap();

        assert!(headers.contains(&("Wechatpay-Timestamp".to_owned(), "1554208460".to_owned())));
        assert!(headers.contains(&("Wechatpay-Nonce".to_owned(), "abc".to_owned())));
    }
}
