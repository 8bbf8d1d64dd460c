//! Request signing for brokers that require an HMAC over each order call

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::common::errors::{Result, TraderError};

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature for API requests
///
/// # Arguments
/// * `secret` - Signing secret (base64 encoded)
/// * `timestamp` - Unix timestamp in milliseconds
/// * `method` - HTTP method (GET, POST, etc.)
/// * `request_path` - API endpoint path
/// * `body` - Request body (empty string for GET requests)
pub fn sign_request(
    secret: &str,
    timestamp: i64,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<String> {
    let secret_bytes = BASE64
        .decode(secret)
        .map_err(|e| TraderError::Authentication(format!("Failed to decode secret: {}", e)))?;

    let message = format!("{}{}{}{}", timestamp, method.to_uppercase(), request_path, body);

    let mut mac = HmacSha256::new_from_slice(&secret_bytes)
        .map_err(|e| TraderError::Authentication(format!("Failed to create HMAC: {}", e)))?;
    mac.update(message.as_bytes());

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Hex SHA-256 of the request body
pub fn body_digest(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Build the signing headers for one request
pub fn generate_signing_headers(
    app_key: &str,
    signing_secret: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<SigningHeaders> {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let signature = sign_request(signing_secret, timestamp, method, request_path, body)?;

    Ok(SigningHeaders {
        app_key: app_key.to_string(),
        signature,
        timestamp,
        digest: body_digest(body),
    })
}

/// Signing headers attached to order requests
#[derive(Debug, Clone)]
pub struct SigningHeaders {
    pub app_key: String,
    pub signature: String,
    pub timestamp: i64,
    pub digest: String,
}

impl SigningHeaders {
    pub fn apply_to_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("x-app-key", &self.app_key)
            .header("x-signature", &self.signature)
            .header("x-timestamp", self.timestamp.to_string())
            .header("x-content-sha256", &self.digest)
    }
}
