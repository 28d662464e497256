//! HMAC request signing for authenticated status callbacks.
//!
//! Callbacks that traverse the coordinator's notification edge function are
//! signed so the receiver can reject unauthorized callers, replayed
//! requests, and tampered payloads. The signature covers a canonical JSON
//! rendering of the payload (keys sorted lexicographically at every object
//! level) concatenated with a UTC Unix-seconds timestamp:
//!
//! ```text
//! signature = hex(HMAC-SHA256(secret, canonical_json(payload) + timestamp))
//! ```
//!
//! The receiver rejects timestamps older than five minutes.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex signature.
pub const SIGNATURE_HEADER: &str = "X-Executor-Signature";
/// Header carrying the Unix-seconds timestamp the signature covers.
pub const TIMESTAMP_HEADER: &str = "X-Executor-Timestamp";

/// Maximum accepted signature age in seconds.
pub const MAX_SIGNATURE_AGE_SECS: i64 = 300;

/// Serialize a JSON value canonically: object keys sorted lexicographically
/// at every level, arrays in order, primitives rendered by the standard
/// JSON rules. Both sides of the signature must produce identical bytes.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

/// A computed signature ready to attach as headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signature: String,
    pub timestamp: String,
}

/// Sign a payload with the shared secret at the given Unix time.
pub fn sign(payload: &Value, secret: &str, unix_seconds: i64) -> Signature {
    let timestamp = unix_seconds.to_string();
    let message = format!("{}{}", canonical_json(payload), timestamp);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    Signature {
        signature,
        timestamp,
    }
}

/// Receiver-side verification: recompute the signature and check the
/// timestamp window. Comparison is constant-time via the HMAC verify path.
pub fn verify(
    payload: &Value,
    secret: &str,
    signature_hex: &str,
    timestamp: &str,
    now_unix_seconds: i64,
) -> bool {
    let Ok(signed_at) = timestamp.parse::<i64>() else {
        return false;
    };
    if now_unix_seconds - signed_at >= MAX_SIGNATURE_AGE_SECS {
        return false;
    }
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let message = format!("{}{}", canonical_json(payload), timestamp);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys_at_every_level() {
        let payload = json!({"b": 1, "a": [3, 2, "x"]});
        assert_eq!(canonical_json(&payload), r#"{"a":[3,2,"x"],"b":1}"#);

        let nested = json!({"z": {"b": true, "a": null}, "a": 1});
        assert_eq!(canonical_json(&nested), r#"{"a":1,"z":{"a":null,"b":true}}"#);
    }

    #[test]
    fn test_signature_matches_reference_canonical_form() {
        // The signature over the unsorted payload must equal the HMAC over
        // the byte-for-byte sorted rendering plus the timestamp.
        let payload = json!({"b": 1, "a": [3, 2, "x"]});
        let secret = "fixed-secret";
        let ts = 1_700_000_000i64;

        let sig = sign(&payload, secret, ts);

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!(r#"{{"a":[3,2,"x"],"b":1}}{}"#, ts).as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(sig.signature, expected);
        assert_eq!(sig.timestamp, "1700000000");
    }

    #[test]
    fn test_verify_round_trip() {
        let payload = json!({"notification_type": "sla_violation_alert", "violations": []});
        let sig = sign(&payload, "s3cret", 1000);
        assert!(verify(&payload, "s3cret", &sig.signature, &sig.timestamp, 1010));
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let payload = json!({"count": 1});
        let sig = sign(&payload, "s3cret", 1000);
        let tampered = json!({"count": 2});
        assert!(!verify(&tampered, "s3cret", &sig.signature, &sig.timestamp, 1010));
    }

    #[test]
    fn test_verify_rejects_replay_after_window() {
        // Signed at T, replayed at T + 6 minutes: must be rejected.
        let payload = json!({"b": 1});
        let signed_at = 1_700_000_000i64;
        let sig = sign(&payload, "s3cret", signed_at);
        assert!(!verify(
            &payload,
            "s3cret",
            &sig.signature,
            &sig.timestamp,
            signed_at + 360,
        ));
        // Just inside the window it still verifies.
        assert!(verify(
            &payload,
            "s3cret",
            &sig.signature,
            &sig.timestamp,
            signed_at + 299,
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let payload = json!({"b": 1});
        let sig = sign(&payload, "right", 1000);
        assert!(!verify(&payload, "wrong", &sig.signature, &sig.timestamp, 1001));
    }
}
