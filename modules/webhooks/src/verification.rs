//! Authenticity checks applied to raw callback bodies.
//!
//! Every check works on the exact bytes received; nothing is re-serialized
//! before hashing. Comparisons of secrets and digests are constant time.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Outcome of a verification strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set when the callback was let through without checking a signature
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub accepted_unsigned: bool,
}

impl Verification {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
            accepted_unsigned: false,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            accepted_unsigned: false,
        }
    }

    /// Accepted without a cryptographic check; the reason is kept for audit.
    pub fn accepted_unsigned(reason: impl Into<String>) -> Self {
        Self {
            valid: true,
            reason: Some(reason.into()),
            accepted_unsigned: true,
        }
    }
}

/// What to do when a provider that signs its callbacks has no secret configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingSecretPolicy {
    Reject,
    WarnAndAccept,
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// HMAC-SHA512 of `payload`, compared against a hex digest.
pub fn hmac_sha512_hex(payload: &[u8], signature: &str, secret: &str) -> Verification {
    let Ok(received) = hex::decode(signature.trim()) else {
        return Verification::invalid("signature is not valid hex");
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return Verification::invalid("unusable secret");
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    if constant_time_eq(&expected, &received) {
        Verification::valid()
    } else {
        Verification::invalid("signature mismatch")
    }
}

/// HMAC-SHA256 of `payload`, compared against a base64 digest.
pub fn hmac_sha256_base64(payload: &[u8], signature: &str, secret: &str) -> Verification {
    let Ok(received) = STANDARD.decode(signature.trim()) else {
        return Verification::invalid("signature is not valid base64");
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return Verification::invalid("unusable secret");
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    if constant_time_eq(&expected, &received) {
        Verification::valid()
    } else {
        Verification::invalid("signature mismatch")
    }
}

/// Shared-token equality. Accepts the raw token or an `Authorization: Bearer` value.
pub fn bearer_token(signature: &str, token: &str) -> Verification {
    let presented = signature.trim();
    let presented = presented
        .get(..7)
        .filter(|p| p.eq_ignore_ascii_case("bearer "))
        .map(|_| presented[7..].trim())
        .unwrap_or(presented);

    if constant_time_eq(presented.as_bytes(), token.as_bytes()) {
        Verification::valid()
    } else {
        Verification::invalid("token mismatch")
    }
}
