//! Credentials and signed authentication construction.
//!
//! The first frame on every mux connection is a binary auth record signed
//! with HMAC-SHA256 over the ASCII concatenation
//! `"auth" || accessKey || isoDate || base64(nonce)`. The legacy
//! single-envelope path sends the same material as a JSON `auth` request.
//!
//! The access key must encode to exactly 20 UTF-8 bytes: peers read exactly
//! 20 bytes from the fixed-offset field, so shorter keys are rejected rather
//! than NUL-padded. The ISO-8601 date must be the 24-character millisecond
//! form or the 27-character microsecond form.

use crate::envelope::Request;
use crate::error::{MirrorError, Result};
use crate::frame::{AuthFrame, ACCESS_KEY_LEN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Connection credentials, immutable for the lifetime of a connection.
#[derive(Clone)]
pub struct Credentials {
    /// Access key; must encode to exactly 20 UTF-8 bytes.
    pub access_key: String,
    /// Opaque HMAC-SHA256 key material.
    pub private_key: Vec<u8>,
    /// Identifies this device to the server.
    pub device_uuid: String,
}

impl Credentials {
    pub fn new(
        access_key: impl Into<String>,
        private_key: Vec<u8>,
        device_uuid: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            private_key,
            device_uuid: device_uuid.into(),
        }
    }

    /// Generate a fresh device UUID for first-run provisioning.
    pub fn generate_device_uuid() -> String {
        Uuid::new_v4().to_string()
    }
}

impl fmt::Debug for Credentials {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("private_key", &"<redacted>")
            .field("device_uuid", &self.device_uuid)
            .finish()
    }
}

/// Build the signed binary auth frame with a fresh nonce and the current time.
pub fn build_auth_frame(creds: &Credentials) -> Result<AuthFrame> {
    let nonce: [u8; 8] = rand::random();
    sign_auth_frame(creds, &iso_now(), nonce)
}

/// Build the legacy JSON auth envelope with a fresh nonce and the current time.
pub fn build_auth_request(creds: &Credentials) -> Result<Request> {
    let nonce: [u8; 8] = rand::random();
    let date = iso_now();
    let (_, signature, b64_nonce) = sign(creds, &date, nonce)?;
    Ok(Request::Auth {
        access_key: creds.access_key.clone(),
        date,
        nonce: b64_nonce,
        signature: BASE64.encode(signature),
        device_uuid: creds.device_uuid.clone(),
    })
}

/// Sign an auth frame with explicit date and nonce.
///
/// The public entry points supply wall-clock time and random bytes; this
/// form exists so tests can pin both.
pub(crate) fn sign_auth_frame(
    creds: &Credentials,
    iso_date: &str,
    nonce: [u8; 8],
) -> Result<AuthFrame> {
    if iso_date.len() != 24 && iso_date.len() != 27 {
        return Err(MirrorError::Auth(format!(
            "ISO date must be 24 or 27 characters, got {}",
            iso_date.len()
        )));
    }
    let (access_key, signature, _) = sign(creds, iso_date, nonce)?;
    Ok(AuthFrame {
        version: 0,
        access_key,
        nonce,
        signature,
        date: iso_date.to_string(),
    })
}

/// Compute the HMAC signature and fixed-width key for the given material.
fn sign(
    creds: &Credentials,
    iso_date: &str,
    nonce: [u8; 8],
) -> Result<([u8; ACCESS_KEY_LEN], [u8; 32], String)> {
    let key_bytes = creds.access_key.as_bytes();
    if key_bytes.len() != ACCESS_KEY_LEN {
        return Err(MirrorError::Auth(format!(
            "access key must encode to exactly {} UTF-8 bytes, got {}",
            ACCESS_KEY_LEN,
            key_bytes.len()
        )));
    }

    let b64_nonce = BASE64.encode(nonce);

    let mut mac = HmacSha256::new_from_slice(&creds.private_key)
        .map_err(|e| MirrorError::Auth(format!("invalid HMAC key: {}", e)))?;
    mac.update(b"auth");
    mac.update(key_bytes);
    mac.update(iso_date.as_bytes());
    mac.update(b64_nonce.as_bytes());
    let signature: [u8; 32] = mac.finalize().into_bytes().into();

    let mut access_key = [0u8; ACCESS_KEY_LEN];
    access_key.copy_from_slice(key_bytes);
    Ok((access_key, signature, b64_nonce))
}

/// Current UTC time in the 24-character millisecond ISO-8601 form.
fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
