//! Service shared access signatures.
//!
//! Tokens are signed locally with the account key (HMAC-SHA256 over the
//! service SAS string-to-sign) and never leave the process except as URL
//! query parameters.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;

use crate::BlobError;

/// REST API version used for both signing and requests.
pub const SERVICE_VERSION: &str = "2021-08-06";

/// Shortest lifetime a token is issued with.
pub const MIN_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Longest lifetime a token is issued with.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(200 * 60 * 60);

/// Clamps a requested lifetime into `[MIN_TOKEN_TTL, MAX_TOKEN_TTL]`.
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_TOKEN_TTL, MAX_TOKEN_TTL)
}

/// Decoded storage account key.
#[derive(Clone)]
pub struct AccountKey(Vec<u8>);

impl AccountKey {
    /// Decodes a base64 account key as shown in the portal.
    pub fn from_base64(account: &str, encoded: &str) -> Result<Self, BlobError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| BlobError::InvalidKey(account.to_string()))?;
        if bytes.is_empty() {
            return Err(BlobError::InvalidKey(account.to_string()));
        }
        Ok(Self(bytes))
    }

    fn sign(&self, account: &str, message: &str) -> Result<String, BlobError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.0)
            .map_err(|_| BlobError::InvalidKey(account.to_string()))?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccountKey(..)")
    }
}

/// Permission set of a token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SasPermissions {
    pub read: bool,
    pub create: bool,
    pub write: bool,
    pub delete: bool,
}

impl SasPermissions {
    pub const READ: Self = Self {
        read: true,
        create: false,
        write: false,
        delete: false,
    };

    pub const WRITE: Self = Self {
        read: false,
        create: true,
        write: true,
        delete: false,
    };

    pub const DELETE: Self = Self {
        read: false,
        create: false,
        write: false,
        delete: true,
    };

    /// Canonical `sp` value. Order is fixed by the service.
    pub fn as_str(&self) -> String {
        let mut s = String::with_capacity(4);
        if self.read {
            s.push('r');
        }
        if self.create {
            s.push('c');
        }
        if self.write {
            s.push('w');
        }
        if self.delete {
            s.push('d');
        }
        s
    }
}

/// Signed resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasResource<'a> {
    Container,
    Blob(&'a str),
}

/// A signed token, ready to append to a resource URL.
#[derive(Debug, Clone)]
pub struct SasToken {
    query: String,
    expires_at: DateTime<Utc>,
    permissions: SasPermissions,
}

impl SasToken {
    /// Query string without the leading `?`.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn permissions(&self) -> SasPermissions {
        self.permissions
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Wraps an opaque query string. Used by stores that do not sign.
    pub fn opaque(query: String, expires_at: DateTime<Utc>, permissions: SasPermissions) -> Self {
        Self {
            query,
            expires_at,
            permissions,
        }
    }
}

/// Signs a service SAS for `container` (and optionally one blob in it).
///
/// `ttl` is clamped with [`clamp_ttl`].
pub fn sign(
    account: &str,
    key: &AccountKey,
    container: &str,
    resource: SasResource<'_>,
    permissions: SasPermissions,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<SasToken, BlobError> {
    let ttl = clamp_ttl(ttl);
    let expires_at = now + chrono::Duration::seconds(ttl.as_secs() as i64);
    let expiry = expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let sp = permissions.as_str();

    let (canonical, sr) = match resource {
        SasResource::Container => (format!("/blob/{account}/{container}"), "c"),
        SasResource::Blob(blob) => (format!("/blob/{account}/{container}/{blob}"), "b"),
    };

    // sp, st, se, resource, si, sip, spr, sv, sr, snapshot, ses,
    // rscc, rscd, rsce, rscl, rsct
    let string_to_sign = [
        sp.as_str(),
        "",
        expiry.as_str(),
        canonical.as_str(),
        "",
        "",
        "https",
        SERVICE_VERSION,
        sr,
        "",
        "",
        "",
        "",
        "",
        "",
        "",
    ]
    .join("\n");

    let signature = key.sign(account, &string_to_sign)?;
    let query = format!(
        "sv={SERVICE_VERSION}&sr={sr}&sp={sp}&se={}&spr=https&sig={}",
        utf8_percent_encode(&expiry, NON_ALPHANUMERIC),
        utf8_percent_encode(&signature, NON_ALPHANUMERIC),
    );

    Ok(SasToken {
        query,
        expires_at,
        permissions,
    })
}
