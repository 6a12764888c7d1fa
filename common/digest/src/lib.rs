use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Deployment-wide salt used to fingerprint sensitive strings (IPs, API keys, user
/// agents) before they are allowed anywhere near the audit store. Comparable only
/// within a single deployment: two gateways with different salts will never agree
/// on the digest of the same input, by design.
#[derive(Clone)]
pub struct DigestSalt(Vec<u8>);

impl DigestSalt {
    pub fn new(salt: impl Into<Vec<u8>>) -> Self {
        Self(salt.into())
    }

    pub fn from_env(var: &str) -> Result<Self, std::env::VarError> {
        std::env::var(var).map(|value| Self(value.into_bytes()))
    }
}

/// One-way fingerprint of `input` using HMAC-SHA256 under `salt`, hex-encoded to a
/// 64-character string. `None` maps to `None` rather than the digest of an empty
/// string, so absence of a value (no API key presented, no user agent sent) stays
/// distinguishable from the empty string at rest.
pub fn digest(input: Option<&str>, salt: &DigestSalt) -> Option<String> {
    let value = input?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&salt.0).expect("HMAC accepts any key length");
    mac.update(value.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}
