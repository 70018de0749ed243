use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Future skew tolerated by [`HmacSigner::verify_fresh`].
const MAX_CLOCK_SKEW: Duration = Duration::seconds(60);

/// HMAC-SHA256 signer for webhook authentication.
///
/// The signed message is `{timestamp}.{body}` where `timestamp` is the exact
/// `X-Timestamp` header value and `body` the exact request body.
pub struct HmacSigner {
    secret: String,
}

impl HmacSigner {
    /// New HMAC signer with the given secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Sign a body for the given timestamp. Returns lowercase hex.
    pub fn sign(&self, timestamp: &str, body: &str) -> String {
        let message = format!("{timestamp}.{body}");
        hex::encode(self.hmac_sha256(message.as_bytes()))
    }

    /// Verify a hex signature in constant time.
    ///
    /// Malformed input (non-hex, wrong length) is a mismatch, never an error.
    pub fn verify(&self, timestamp: &str, body: &str, signature: &str) -> bool {
        let Ok(provided) = hex::decode(signature.trim()) else {
            return false;
        };
        let message = format!("{timestamp}.{body}");
        let expected = self.hmac_sha256(message.as_bytes());

        expected.len() == provided.len() && bool::from(expected.ct_eq(&provided))
    }

    /// [`verify`](Self::verify) plus a replay window on the RFC 3339 timestamp.
    ///
    /// Rejects timestamps older than `max_age` or more than a minute ahead of `now`.
    pub fn verify_fresh(
        &self,
        timestamp: &str,
        body: &str,
        signature: &str,
        now: OffsetDateTime,
        max_age: Duration,
    ) -> bool {
        let Ok(signed_at) = OffsetDateTime::parse(timestamp, &Rfc3339) else {
            return false;
        };
        let age = now - signed_at;
        if age > max_age || -age > MAX_CLOCK_SKEW {
            return false;
        }
        self.verify(timestamp, body, signature)
    }

    /// Compute HMAC-SHA256
    fn hmac_sha256(&self, message: &[u8]) -> Vec<u8> {
        use hmac::{Hmac, Mac};
        type HmacSha256 = Hmac<Sha256>;

        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC key can be of any size, as per crate documentation"),
        };

        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Serialize `value` with object keys in sorted order.
///
/// Going through [`serde_json::Value`] sorts every nested object, so the
/// same logical payload always produces the same bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value: Value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}
