use std::fmt;

use hex::ToHex;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use unicode_normalization::UnicodeNormalization;

/// Client IP used when no forwarding header carries one.
pub const UNKNOWN_CLIENT_IP: &str = "unknown";

/// Header injected by the CDN edge. Trusted first.
pub const EDGE_CLIENT_IP_HEADER: &str = "cf-connecting-ip";
pub const PROXY_CLIENT_IP_HEADER: &str = "x-real-ip";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Opaque one-way hash of a fingerprint or client IP: 64 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrates a token read back from storage. Returns `None` unless the
    /// value has the exact shape `hash_identity` produces.
    pub fn from_stored(value: String) -> Option<Self> {
        is_sha256_hex(&value).then_some(Self(value))
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidIdentity;

impl fmt::Display for InvalidIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity material must not be empty")
    }
}

impl std::error::Error for InvalidIdentity {}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_sha256_hex(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 64 {
        return false;
    }
    bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Trims surrounding whitespace and applies Unicode NFC so visually equal
/// fingerprints hash to the same token.
pub fn normalize_identity_material(input: &str) -> String {
    input.trim().nfc().collect::<String>()
}

/// Hashes raw identity material into an [`IdentityToken`].
///
/// Blank input is rejected; callers fall back to the resolved client IP
/// instead of hashing nothing.
pub fn hash_identity(raw: &str) -> Result<IdentityToken, InvalidIdentity> {
    let normalized = normalize_identity_material(raw);
    if normalized.is_empty() {
        return Err(InvalidIdentity);
    }
    Ok(IdentityToken(sha256_hex(normalized.as_bytes())))
}

/// Identifier for login throttling: `hash(username + ":" + client_ip)`.
pub fn login_identifier(username: &str, client_ip: &str) -> Result<IdentityToken, InvalidIdentity> {
    let username = normalize_identity_material(username);
    if username.is_empty() {
        return Err(InvalidIdentity);
    }
    hash_identity(&format!("{}:{}", username, client_ip.trim()))
}

/// Token for a request: the fingerprint when one is supplied, else the client IP.
pub fn resolve_identity(
    fingerprint: Option<&str>,
    client_ip: &str,
) -> Result<IdentityToken, InvalidIdentity> {
    match fingerprint.map(str::trim).filter(|v| !v.is_empty()) {
        Some(fingerprint) => hash_identity(fingerprint),
        None => hash_identity(client_ip),
    }
}

/// Resolves the client IP from forwarding headers, edge-most trusted header first.
pub fn resolve_client_ip(headers: &HeaderMap) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    };

    if let Some(ip) = header_value(EDGE_CLIENT_IP_HEADER) {
        return ip.to_string();
    }
    if let Some(ip) = header_value(PROXY_CLIENT_IP_HEADER) {
        return ip.to_string();
    }
    if let Some(first_hop) = header_value(FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
    {
        return first_hop.to_string();
    }

    UNKNOWN_CLIENT_IP.to_string()
}
