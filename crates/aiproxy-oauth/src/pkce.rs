use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub verifier: String,
    pub challenge: String,
}

/// RFC 7636 S256 pair. The verifier is 96 cryptographically-random bytes in
/// URL-safe base64 without padding.
pub fn generate_pkce() -> PkceCodes {
    let mut bytes = [0u8; 96];
    rand::rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    PkceCodes {
        verifier,
        challenge,
    }
}

/// Hex state token for authorization-code flows.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_is_urlsafe_and_long() {
        let codes = generate_pkce();
        assert_eq!(codes.verifier.len(), 128);
        assert!(
            codes
                .verifier
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        );
        assert!(!codes.challenge.is_empty());
        assert_ne!(codes.verifier, codes.challenge);
    }

    #[test]
    fn challenge_is_s256_of_verifier() {
        let codes = generate_pkce();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(codes.verifier.as_bytes()));
        assert_eq!(codes.challenge, expected);
    }

    #[test]
    fn state_is_hex_and_validates() {
        let state = generate_state();
        assert_eq!(state.len(), 64);
        assert!(state.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(aiproxy_common::validate_state(&state).is_ok());
    }

    #[test]
    fn tokens_do_not_repeat() {
        assert_ne!(generate_state(), generate_state());
        assert_ne!(generate_pkce().verifier, generate_pkce().verifier);
    }
}
