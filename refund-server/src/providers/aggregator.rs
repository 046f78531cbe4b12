//! Aggregator refund gateway (Alipay / WeChat via a Chinese aggregator)
//!
//! The gateway speaks form-encoded requests signed with RSA over a
//! canonicalized parameter string: drop `sign` and `sign_type`, drop empty or
//! composite values, sort keys in ASCII byte order, join as `k1=v1&k2=v2`.
//! Responses are JSON and, when a public key is configured and the body
//! carries a `sign`, verified by the same canonicalization.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use shared::error::{AppError, AppResult, ErrorKind};

use super::ProviderRefundOutcome;
use crate::config::Config;

/// Which order-number field the gateway expects for this refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderNoField {
    /// Gateway-side trade number
    TradeNo,
    /// Merchant-side order number
    #[allow(dead_code)]
    OutTradeNo,
}

impl OrderNoField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TradeNo => "trade_no",
            Self::OutTradeNo => "out_trade_no",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignType {
    /// RSA with SHA-256 (default)
    Rsa2,
    /// RSA with SHA-1
    Rsa,
}

impl SignType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa2 => "RSA2",
            Self::Rsa => "RSA",
        }
    }
}

/// A refund order against the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorRefundRequest {
    pub order_no_field: OrderNoField,
    pub order_no: String,
    /// Yuan string, two decimals
    pub money_yuan: String,
    /// Caller-supplied idempotency key, forwarded as out_refund_no
    pub out_refund_no: String,
    /// Unix seconds
    pub timestamp: i64,
}

pub struct AggregatorClient {
    http: reqwest::Client,
    base_url: String,
    pid: String,
    private_key: RsaPrivateKey,
    public_key: Option<RsaPublicKey>,
    sign_type: SignType,
}

impl AggregatorClient {
    /// Build the client when the gateway is fully configured; `None` when the
    /// relevant variables are absent.
    pub fn from_config(
        config: &Config,
    ) -> Result<Option<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let (Some(base_url), Some(pid), Some(private_key)) = (
            config.aggregator_base_url.as_deref(),
            config.aggregator_pid.as_deref(),
            config.aggregator_private_key.as_deref(),
        ) else {
            return Ok(None);
        };

        let sign_type = match config.aggregator_sign_type.to_ascii_uppercase().as_str() {
            "RSA" => SignType::Rsa,
            _ => SignType::Rsa2,
        };

        let private_key = parse_private_key(private_key)
            .map_err(|e| format!("AGGREGATOR_PRIVATE_KEY: {}", e.message))?;
        let public_key = config
            .aggregator_public_key
            .as_deref()
            .map(parse_public_key)
            .transpose()
            .map_err(|e| format!("AGGREGATOR_PUBLIC_KEY: {}", e.message))?;

        Ok(Some(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            pid: pid.to_string(),
            private_key,
            public_key,
            sign_type,
        }))
    }

    /// Issue one refund. Retrying with the same out_refund_no is safe: the
    /// gateway dedupes on it.
    pub async fn refund(
        &self,
        request: &AggregatorRefundRequest,
    ) -> AppResult<ProviderRefundOutcome> {
        let mut params = serde_json::Map::new();
        params.insert("pid".into(), Value::String(self.pid.clone()));
        params.insert(
            request.order_no_field.as_str().into(),
            Value::String(request.order_no.clone()),
        );
        params.insert("money".into(), Value::String(request.money_yuan.clone()));
        params.insert(
            "out_refund_no".into(),
            Value::String(request.out_refund_no.clone()),
        );
        params.insert(
            "timestamp".into(),
            Value::String(request.timestamp.to_string()),
        );
        params.insert(
            "sign_type".into(),
            Value::String(self.sign_type.as_str().to_string()),
        );

        let canonical = canonical_string(&params);
        let sign = self.sign(canonical.as_bytes())?;

        let mut form: Vec<(String, String)> = params
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        form.push(("sign".into(), sign));

        let url = format!("{}/api/refund", self.base_url);
        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::provider(format!("aggregator request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::provider(format!("aggregator response read failed: {e}")))?;

        let json: Value = serde_json::from_str(&body).map_err(|_| {
            AppError::provider(format!(
                "aggregator returned non-JSON body (http {status})"
            ))
        })?;

        if let Some(object) = json.as_object() {
            self.verify_response(object)?;
        }

        // Gateways disagree on whether code is a number or a string.
        let code = match json.get("code") {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(-1),
            Some(Value::String(s)) => s.parse().unwrap_or(-1),
            _ => -1,
        };
        if code != 0 {
            let msg = json
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("aggregator refund rejected");
            return Err(AppError::provider(format!(
                "aggregator refund failed (code {code}): {msg}"
            )));
        }

        let provider_refund_no = json
            .get("refund_no")
            .and_then(Value::as_str)
            .map(String::from);

        Ok(ProviderRefundOutcome {
            provider_refund_no,
            raw_response: json,
        })
    }

    fn sign(&self, data: &[u8]) -> AppResult<String> {
        let signature = match self.sign_type {
            SignType::Rsa2 => {
                let digest = Sha256::digest(data);
                self.private_key
                    .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            }
            SignType::Rsa => {
                let digest = Sha1::digest(data);
                self.private_key.sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            }
        }
        .map_err(|e| {
            AppError::with_message(ErrorKind::SignatureError, format!("RSA signing failed: {e}"))
        })?;
        Ok(BASE64.encode(signature))
    }

    fn verify(&self, data: &[u8], signature_b64: &str) -> AppResult<()> {
        let Some(public_key) = &self.public_key else {
            return Ok(());
        };
        let signature = BASE64.decode(signature_b64).map_err(|_| {
            AppError::with_message(ErrorKind::SignatureError, "response sign is not base64")
        })?;
        let result = match self.sign_type {
            SignType::Rsa2 => {
                let digest = Sha256::digest(data);
                public_key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            }
            SignType::Rsa => {
                let digest = Sha1::digest(data);
                public_key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &signature)
            }
        };
        result.map_err(|_| {
            AppError::with_message(
                ErrorKind::SignatureError,
                "aggregator response signature verification failed",
            )
        })
    }

    /// Verify a signed response body before trusting it. A body without a
    /// `sign` field, or a client without a public key, passes through.
    fn verify_response(&self, body: &serde_json::Map<String, Value>) -> AppResult<()> {
        if self.public_key.is_none() {
            return Ok(());
        }
        let Some(sign) = body.get("sign").and_then(Value::as_str) else {
            return Ok(());
        };
        let canonical = canonical_string(body);
        self.verify(canonical.as_bytes(), sign)
    }
}

/// Canonical signing string: drop `sign`/`sign_type`, drop entries whose
/// value is empty, null, an array or an object; sort remaining keys in ASCII
/// byte order; join as `k1=v1&k2=v2`.
pub fn canonical_string(params: &serde_json::Map<String, Value>) -> String {
    let mut entries: Vec<(&str, String)> = params
        .iter()
        .filter(|(k, _)| k.as_str() != "sign" && k.as_str() != "sign_type")
        .filter_map(|(k, v)| {
            let rendered = match v {
                Value::String(s) if !s.is_empty() => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.as_str(), rendered))
        })
        .collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    entries
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Accepts PEM, base64-of-PEM, or base64 DER (PKCS#8 or PKCS#1).
pub fn parse_private_key(input: &str) -> AppResult<RsaPrivateKey> {
    let input = input.trim();
    if input.contains("-----BEGIN") {
        return RsaPrivateKey::from_pkcs8_pem(input)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(input))
            .map_err(|e| key_error(format!("unreadable private key PEM: {e}")));
    }
    let decoded = BASE64
        .decode(input.as_bytes())
        .map_err(|_| key_error("private key is neither PEM nor base64"))?;
    if let Ok(pem) = std::str::from_utf8(&decoded) {
        if pem.contains("-----BEGIN") {
            return RsaPrivateKey::from_pkcs8_pem(pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                .map_err(|e| key_error(format!("unreadable base64-wrapped PEM: {e}")));
        }
    }
    RsaPrivateKey::from_pkcs8_der(&decoded)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(&decoded))
        .map_err(|e| key_error(format!("unreadable private key DER: {e}")))
}

/// Accepts SPKI PEM, PKCS#1 PEM, base64-of-PEM, or base64 DER.
pub fn parse_public_key(input: &str) -> AppResult<RsaPublicKey> {
    let input = input.trim();
    if input.contains("-----BEGIN") {
        return RsaPublicKey::from_public_key_pem(input)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(input))
            .map_err(|e| key_error(format!("unreadable public key PEM: {e}")));
    }
    let decoded = BASE64
        .decode(input.as_bytes())
        .map_err(|_| key_error("public key is neither PEM nor base64"))?;
    if let Ok(pem) = std::str::from_utf8(&decoded) {
        if pem.contains("-----BEGIN") {
            return RsaPublicKey::from_public_key_pem(pem)
                .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
                .map_err(|e| key_error(format!("unreadable base64-wrapped PEM: {e}")));
        }
    }
    RsaPublicKey::from_public_key_der(&decoded)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&decoded))
        .map_err(|e| key_error(format!("unreadable public key DER: {e}")))
}

fn key_error(msg: impl Into<String>) -> AppError {
    AppError::with_message(ErrorKind::SignatureError, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
    use serde_json::json;

    fn params(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_canonical_string_sorts_keys_ascii() {
        let map = params(json!({
            "money": "10.00",
            "pid": "1001",
            "trade_no": "T123",
            "out_refund_no": "agg_b1_T123_1000",
            "timestamp": "1700000000",
            "sign_type": "RSA2",
        }));
        assert_eq!(
            canonical_string(&map),
            "money=10.00&out_refund_no=agg_b1_T123_1000&pid=1001&timestamp=1700000000&trade_no=T123"
        );
    }

    #[test]
    fn test_canonical_string_drops_sign_fields_and_composites() {
        let map = params(json!({
            "pid": "1001",
            "sign": "xxxx",
            "sign_type": "RSA2",
            "empty": "",
            "null_value": null,
            "nested": {"a": 1},
            "list": [1, 2],
            "code": 0,
            "ok": true,
        }));
        assert_eq!(canonical_string(&map), "code=0&ok=true&pid=1001");
    }

    #[test]
    fn test_canonical_string_empty_map() {
        assert_eq!(canonical_string(&serde_json::Map::new()), "");
    }

    fn test_client(sign_type: SignType) -> AggregatorClient {
        // Small key keeps the test fast; production keys come from config.
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        AggregatorClient {
            http: reqwest::Client::new(),
            base_url: "http://gateway.test".into(),
            pid: "1001".into(),
            private_key,
            public_key: Some(public_key),
            sign_type,
        }
    }

    #[test]
    fn test_sign_verify_round_trip_rsa2() {
        let client = test_client(SignType::Rsa2);
        let data = b"money=10.00&pid=1001&timestamp=1700000000";
        let sig = client.sign(data).unwrap();
        client.verify(data, &sig).unwrap();
    }

    #[test]
    fn test_sign_verify_round_trip_rsa1() {
        let client = test_client(SignType::Rsa);
        let data = b"money=10.00&pid=1001";
        let sig = client.sign(data).unwrap();
        client.verify(data, &sig).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let client = test_client(SignType::Rsa2);
        let sig = client.sign(b"money=10.00").unwrap();
        let err = client.verify(b"money=99.00", &sig).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SignatureError);
    }

    #[test]
    fn test_verify_response_checks_embedded_sign() {
        let client = test_client(SignType::Rsa2);
        let mut body = params(json!({"code": 0, "msg": "ok", "refund_no": "R1"}));
        let canonical = canonical_string(&body);
        let sig = client.sign(canonical.as_bytes()).unwrap();
        body.insert("sign".into(), Value::String(sig));
        client.verify_response(&body).unwrap();

        body.insert("msg".into(), Value::String("tampered".into()));
        assert!(client.verify_response(&body).is_err());
    }

    #[test]
    fn test_parse_private_key_pem_and_wrapped_forms() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF).unwrap();

        assert!(parse_private_key(&pem).is_ok());
        assert!(parse_private_key(&BASE64.encode(pem.as_bytes())).is_ok());

        let der = key.to_pkcs8_der().unwrap();
        assert!(parse_private_key(&BASE64.encode(der.as_bytes())).is_ok());

        assert!(parse_private_key("not a key").is_err());
    }

    #[test]
    fn test_parse_public_key_spki() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public = RsaPublicKey::from(&key);
        let pem = public.to_public_key_pem(rsa::pkcs8::LineEnding::LF).unwrap();
        assert!(parse_public_key(&pem).is_ok());
        assert!(parse_public_key(&BASE64.encode(pem.as_bytes())).is_ok());
    }
}
