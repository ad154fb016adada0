//! Credential encryption at rest
//!
//! Credential payloads are serialized to JSON and sealed with AES-256-GCM before
//! they reach the database. The key is supplied by the deployer and is never
//! stored alongside the data.

use crate::model::CredentialPayload;
use crate::{BrokerError, Result};
use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::sync::Arc;

pub const ENCRYPTION_KEY_ENV: &str = "BROKER_ENCRYPTION_KEY";

const NONCE_LEN: usize = 12;

/// Sealed credential as stored in the database
///
/// Format: "nonce:ciphertext" (both base64-encoded)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSecret(String);

impl EncryptedSecret {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a stored value, checking shape only
    pub fn from_database(s: String) -> Result<Self> {
        let (nonce_part, ciphertext_part) = split_sealed(&s)?;
        BASE64
            .decode(nonce_part)
            .map_err(|_| BrokerError::validation("Invalid nonce encoding"))?;
        BASE64
            .decode(ciphertext_part)
            .map_err(|_| BrokerError::validation("Invalid ciphertext encoding"))?;
        Ok(Self(s))
    }
}

impl std::fmt::Display for EncryptedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let preview = self.0.chars().take(16).collect::<String>();
        write!(f, "[encrypted:{}...]", preview)
    }
}

fn split_sealed(s: &str) -> Result<(&str, &str)> {
    let mut parts = s.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(nonce), Some(ciphertext), None) => Ok((nonce, ciphertext)),
        _ => Err(BrokerError::validation(
            "Invalid encrypted value format. Expected 'nonce:ciphertext'.",
        )),
    }
}

/// AES-256-GCM sealer shared by storage backends
#[derive(Clone)]
pub struct CredentialEncryption {
    cipher: Arc<Aes256Gcm>,
}

impl CredentialEncryption {
    /// Build from a raw 32-byte key
    pub fn from_key(key: [u8; 32]) -> Self {
        Self {
            cipher: Arc::new(Aes256Gcm::new(&key.into())),
        }
    }

    /// Build from a base64-encoded 32-byte key
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let key_bytes = BASE64.decode(key_b64.trim()).map_err(|_| {
            BrokerError::config(format!(
                "{} must be valid base64.\n\
                 Generate with: openssl rand -base64 32",
                ENCRYPTION_KEY_ENV
            ))
        })?;

        let key_len = key_bytes.len();
        let key: [u8; 32] = key_bytes.try_into().map_err(|_| {
            BrokerError::config(format!(
                "{} must be exactly 32 bytes (256 bits). Current: {} bytes.",
                ENCRYPTION_KEY_ENV, key_len
            ))
        })?;

        Ok(Self::from_key(key))
    }

    /// Load the key from `BROKER_ENCRYPTION_KEY`
    pub fn from_env() -> Result<Self> {
        let key_b64 = std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| {
            BrokerError::config(format!(
                "{} environment variable is REQUIRED.\n\
                 \n\
                 Generate a secure encryption key:\n\
                 $ openssl rand -base64 32\n\
                 \n\
                 IMPORTANT: Back up this key securely - losing it means losing every stored credential",
                ENCRYPTION_KEY_ENV
            ))
        })?;
        Self::from_base64(&key_b64)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| BrokerError::internal(format!("Credential encryption failed: {}", e)))?;

        Ok(EncryptedSecret(format!(
            "{}:{}",
            BASE64.encode(nonce),
            BASE64.encode(&ciphertext)
        )))
    }

    pub fn decrypt(&self, sealed: &EncryptedSecret) -> Result<String> {
        let (nonce_part, ciphertext_part) = split_sealed(&sealed.0)?;

        let nonce_bytes = BASE64
            .decode(nonce_part)
            .map_err(|_| BrokerError::validation("Invalid nonce encoding"))?;
        let ciphertext = BASE64
            .decode(ciphertext_part)
            .map_err(|_| BrokerError::validation("Invalid ciphertext encoding"))?;

        let nonce_len = nonce_bytes.len();
        let nonce: [u8; NONCE_LEN] = nonce_bytes.try_into().map_err(|_| {
            BrokerError::validation(format!(
                "Invalid nonce length: {} bytes (expected {})",
                nonce_len, NONCE_LEN
            ))
        })?;

        // Fails on a wrong key or tampered ciphertext
        let plaintext = self
            .cipher
            .decrypt(&nonce.into(), ciphertext.as_ref())
            .map_err(|_| {
                BrokerError::internal("Credential decryption failed (wrong key or tampered data)")
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| BrokerError::validation("Decrypted credential contains invalid UTF-8"))
    }

    pub fn seal_payload(&self, payload: &CredentialPayload) -> Result<EncryptedSecret> {
        self.encrypt(&serde_json::to_string(payload)?)
    }

    pub fn open_payload(&self, sealed: &EncryptedSecret) -> Result<CredentialPayload> {
        Ok(serde_json::from_str(&self.decrypt(sealed)?)?)
    }

    /// Fixed-key sealer for tests
    pub fn for_testing() -> Self {
        Self::from_key([42u8; 32])
    }
}

impl std::fmt::Debug for CredentialEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEncryption")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OAuthToken;

    #[test]
    fn test_same_plaintext_different_ciphertexts() {
        let sealer = CredentialEncryption::for_testing();
        let first = sealer.encrypt("same_token_content").unwrap();
        let second = sealer.encrypt("same_token_content").unwrap();

        assert_ne!(first, second);
        assert_eq!(sealer.decrypt(&first).unwrap(), "same_token_content");
        assert_eq!(sealer.decrypt(&second).unwrap(), "same_token_content");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let sealer = CredentialEncryption::for_testing();
        let sealed = sealer.encrypt("test_token").unwrap();

        let mut tampered = sealed.0.clone();
        if let Some(last) = tampered.pop() {
            tampered.push(if last == 'A' { 'B' } else { 'A' });
        }

        assert!(sealer.decrypt(&EncryptedSecret(tampered)).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = CredentialEncryption::for_testing()
            .encrypt("secret_data")
            .unwrap();
        let other = CredentialEncryption::from_key([99u8; 32]);
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_invalid_format_rejected() {
        assert!(EncryptedSecret::from_database("no_colon_here".to_string()).is_err());
        assert!(EncryptedSecret::from_database("a:b:c".to_string()).is_err());
        assert!(EncryptedSecret::from_database("not-base64!!!:also!!!".to_string()).is_err());
    }

    #[test]
    fn test_from_base64_requires_32_bytes() {
        let short = BASE64.encode([1u8; 16]);
        let err = CredentialEncryption::from_base64(&short).unwrap_err().to_string();
        assert!(err.contains("32 bytes"));

        let good = BASE64.encode([1u8; 32]);
        assert!(CredentialEncryption::from_base64(&good).is_ok());
    }

    #[test]
    fn test_sealed_payload_hides_token() {
        let sealer = CredentialEncryption::for_testing();
        let payload = CredentialPayload::OAuthToken(OAuthToken {
            access_token: "gho_plaintext_token".to_string(),
            refresh_token: Some("ghr_refresh".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: None,
            issued_at: None,
            scopes: vec!["repo".to_string()],
        });

        let sealed = sealer.seal_payload(&payload).unwrap();
        assert!(!sealed.as_str().contains("gho_plaintext_token"));
        assert!(!format!("{}", sealed).contains("gho_plaintext_token"));
        assert_eq!(sealer.open_payload(&sealed).unwrap(), payload);
    }
}
