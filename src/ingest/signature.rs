use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use crate::error::{PatrickError, Result};

/// Signature headers as GitHub sends them, e.g. `sha256=<hex>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Signatures<'a> {
    /// `X-Hub-Signature-256`
    pub sha256: Option<&'a str>,
    /// `X-Hub-Signature`
    pub sha1: Option<&'a str>,
}

/// Checks the body against the strongest signature present. Comparison
/// is constant time.
pub fn verify(secret: &str, body: &[u8], signatures: Signatures<'_>) -> Result<()> {
    if let Some(header) = signatures.sha256 {
        let expected = decode(header, "sha256=")?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| PatrickError::Internal(e.to_string()))?;
        mac.update(body);
        return mac
            .verify_slice(&expected)
            .map_err(|_| PatrickError::Signature("sha256 signature mismatch".to_string()));
    }

    if let Some(header) = signatures.sha1 {
        let expected = decode(header, "sha1=")?;
        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
            .map_err(|e| PatrickError::Internal(e.to_string()))?;
        mac.update(body);
        return mac
            .verify_slice(&expected)
            .map_err(|_| PatrickError::Signature("sha1 signature mismatch".to_string()));
    }

    Err(PatrickError::Signature("missing signature header".to_string()))
}

fn decode(header: &str, prefix: &str) -> Result<Vec<u8>> {
    let hex_digest = header
        .trim()
        .strip_prefix(prefix)
        .ok_or_else(|| PatrickError::Signature(format!("expected `{}` prefix", prefix)))?;
    hex::decode(hex_digest).map_err(|_| PatrickError::Signature("malformed signature".to_string()))
}

/// Signs `body` the way GitHub does for `X-Hub-Signature-256`.
pub fn sign_sha256(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| PatrickError::Internal(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
