use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA-256 of `payload` keyed by `token`, lowercase hex.
pub fn sign(token: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(token.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The string the control plane recomputes: `agentId ∥ nonce ∥ decimal(ts)`.
pub fn auth_payload(agent_id: &str, nonce: &str, ts: i64) -> String {
    format!("{}{}{}", agent_id, nonce, ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rfc4231_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            sign("Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn output_is_lowercase_hex_of_32_bytes() {
        let sig = sign("k", "a1nonce1700000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(sig, sign("k", "a1nonce1700000000"));
        assert_ne!(sig, sign("k2", "a1nonce1700000000"));
    }

    #[test]
    fn empty_and_oversized_keys_sign() {
        assert_eq!(sign("", "x").len(), 64);
        assert_eq!(sign(&"k".repeat(200), "x").len(), 64);
    }

    #[test]
    fn auth_payload_concatenates_without_separators() {
        assert_eq!(auth_payload("a1", "n-1", 1700000000), "a1n-11700000000");
    }
}
