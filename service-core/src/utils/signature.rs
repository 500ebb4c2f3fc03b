use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload` keyed by `secret`.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Hex-encoded SHA-256 digest of a raw body.
pub fn sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Constant-time string comparison.
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}

/// Verify a hex HMAC-SHA256 signature using constant-time comparison.
pub fn verify_hmac_sha256(
    secret: &str,
    payload: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = hmac_sha256_hex(secret, payload)?;
    Ok(constant_time_eq(&expected, &signature.trim().to_ascii_lowercase()))
}

/// Parsed `ts=<unix>,v1=<hex>` style header.
///
/// Accepts both `t` and `ts` for the timestamp and any number of `v1`
/// entries (providers send several during secret rotation).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampedSignature {
    pub timestamp: Option<String>,
    pub signatures: Vec<String>,
}

impl TimestampedSignature {
    pub fn parse(header: &str) -> Self {
        let mut parsed = Self::default();
        for part in header.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "t" | "ts" => parsed.timestamp = Some(value.trim().to_string()),
                "v1" => parsed.signatures.push(value.trim().to_string()),
                _ => {}
            }
        }
        parsed
    }

    /// True when any `v1` entry matches `HMAC(secret, payload)`.
    pub fn matches(&self, secret: &str, payload: &[u8]) -> Result<bool, anyhow::Error> {
        let expected = hmac_sha256_hex(secret, payload)?;
        Ok(self
            .signatures
            .iter()
            .any(|candidate| constant_time_eq(&expected, candidate)))
    }

    pub fn timestamp_secs(&self) -> Option<i64> {
        self.timestamp.as_deref().and_then(|t| t.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_round_trip() {
        let signature = hmac_sha256_hex("my_secret_key", b"id:123;request-id:abc;ts:1;").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_hmac_sha256("my_secret_key", b"id:123;request-id:abc;ts:1;", &signature).unwrap());
    }

    #[test]
    fn test_tampered_payload() {
        let signature = hmac_sha256_hex("my_secret_key", br#"{"foo":"bar"}"#).unwrap();
        assert!(!verify_hmac_sha256("my_secret_key", br#"{"foo":"baz"}"#, &signature).unwrap());
    }

    #[test]
    fn test_parse_timestamped_header() {
        let parsed = TimestampedSignature::parse("ts=1704908010, v1=abc123,v1=def456");
        assert_eq!(parsed.timestamp.as_deref(), Some("1704908010"));
        assert_eq!(parsed.signatures, vec!["abc123", "def456"]);
        assert_eq!(parsed.timestamp_secs(), Some(1704908010));

        let stripe_style = TimestampedSignature::parse("t=42,v1=ff,v0=ignored");
        assert_eq!(stripe_style.timestamp.as_deref(), Some("42"));
        assert_eq!(stripe_style.signatures, vec!["ff"]);
    }

    #[test]
    fn test_any_rotated_signature_matches() {
        let good = hmac_sha256_hex("secret", b"payload").unwrap();
        let header = format!("t=1,v1=deadbeef,v1={}", good);
        let parsed = TimestampedSignature::parse(&header);
        assert!(parsed.matches("secret", b"payload").unwrap());
        assert!(!parsed.matches("other", b"payload").unwrap());
    }

    #[test]
    fn test_sha256_digest_is_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
