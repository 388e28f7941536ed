//! HMAC-SHA256 query signing for authenticated REST calls

use super::ExchangeError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub struct RequestSigner {
    secret: String,
}

impl RequestSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Hex-encoded HMAC-SHA256 of `message`
    pub fn sign(&self, message: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Build `params&recvWindow=..&timestamp=..&signature=..`, keeping parameter order
    pub fn signed_query(
        &self,
        params: &[(&str, String)],
        timestamp_ms: i64,
        recv_window_ms: u64,
    ) -> Result<String, ExchangeError> {
        let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        parts.push(format!("recvWindow={}", recv_window_ms));
        parts.push(format!("timestamp={}", timestamp_ms));

        let query = parts.join("&");
        let signature = self.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }
}
