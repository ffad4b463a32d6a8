use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Result, SecurityError};

const NONCE_LEN: usize = 12;

/// Wire representation of one logical message: base64 ciphertext plus a
/// base64 SHA-256 hash of the raw ciphertext. The hash is recomputed by the
/// receiver and compared before any decryption is attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureEnvelope {
    pub data: String,
    pub hash: String,
}

/// Message-level encryption shared by every connection of a node.
///
/// The symmetric key is fleet-wide and handed in at construction; transport
/// identity (certificate/key) is a separate layer, see [`crate::TlsSettings`].
/// Safe for concurrent use from multiple connections.
pub struct SecurityContext {
    cipher: Aes256Gcm,
}

impl SecurityContext {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    pub fn from_base64_key(key: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(key)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SecurityError::InvalidKey("key must be 32 bytes".to_string()))?;
        Ok(Self::new(&key))
    }

    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    pub fn generate_base64_key() -> String {
        BASE64.encode(Self::generate_key())
    }

    /// Encrypts a structured message into a wire envelope.
    ///
    /// Ciphertext layout is a random 12-byte nonce followed by the AES-256-GCM
    /// output; the integrity hash covers the whole ciphertext.
    pub fn encrypt_message(&self, message: &serde_json::Value) -> Result<SecureEnvelope> {
        let plaintext = serde_json::to_vec(message)
            .map_err(|e| SecurityError::Malformed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + encrypted.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&encrypted);

        let hash = Sha256::digest(&ciphertext);

        Ok(SecureEnvelope {
            data: BASE64.encode(&ciphertext),
            hash: BASE64.encode(hash),
        })
    }

    /// Verifies and decrypts a wire envelope back into a structured message.
    ///
    /// Fails with [`SecurityError::Integrity`] when the recomputed hash does
    /// not match the transmitted one, and with [`SecurityError::Decryption`]
    /// when the ciphertext cannot be decrypted under the current key. A hash
    /// mismatch never yields plaintext.
    pub fn decrypt_message(&self, envelope: &SecureEnvelope) -> Result<serde_json::Value> {
        let ciphertext = BASE64
            .decode(&envelope.data)
            .map_err(|e| SecurityError::Malformed(format!("ciphertext: {}", e)))?;
        let transmitted_hash = BASE64
            .decode(&envelope.hash)
            .map_err(|e| SecurityError::Malformed(format!("hash: {}", e)))?;

        let computed = Sha256::digest(&ciphertext);
        if computed.as_slice() != transmitted_hash.as_slice() {
            return Err(SecurityError::Integrity);
        }

        if ciphertext.len() < NONCE_LEN {
            return Err(SecurityError::Malformed("ciphertext too short".to_string()));
        }
        let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, encrypted)
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| SecurityError::Malformed(format!("plaintext: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> SecurityContext {
        SecurityContext::new(&SecurityContext::generate_key())
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let ctx = context();
        let message = json!({"type": "heartbeat", "node_id": "collector-1"});

        let envelope = ctx.encrypt_message(&message).unwrap();
        assert_ne!(envelope.data, message.to_string());

        let decrypted = ctx.decrypt_message(&envelope).unwrap();
        assert_eq!(decrypted, message);
    }

    #[test]
    fn tampered_ciphertext_fails_integrity() {
        let ctx = context();
        let envelope = ctx.encrypt_message(&json!({"type": "data"})).unwrap();

        let mut ciphertext = BASE64.decode(&envelope.data).unwrap();
        ciphertext[0] ^= 0x01;
        let tampered = SecureEnvelope {
            data: BASE64.encode(&ciphertext),
            hash: envelope.hash,
        };

        assert!(matches!(
            ctx.decrypt_message(&tampered),
            Err(SecurityError::Integrity)
        ));
    }

    #[test]
    fn tampered_hash_fails_integrity() {
        let ctx = context();
        let envelope = ctx.encrypt_message(&json!({"type": "data"})).unwrap();

        let mut hash = BASE64.decode(&envelope.hash).unwrap();
        hash[3] ^= 0x80;
        let tampered = SecureEnvelope {
            data: envelope.data,
            hash: BASE64.encode(&hash),
        };

        assert!(matches!(
            ctx.decrypt_message(&tampered),
            Err(SecurityError::Integrity)
        ));
    }

    #[test]
    fn every_ciphertext_bit_flip_is_detected() {
        let ctx = context();
        let envelope = ctx.encrypt_message(&json!({"payload": 42})).unwrap();
        let ciphertext = BASE64.decode(&envelope.data).unwrap();

        for byte in 0..ciphertext.len() {
            let mut flipped = ciphertext.clone();
            flipped[byte] ^= 0x10;
            let tampered = SecureEnvelope {
                data: BASE64.encode(&flipped),
                hash: envelope.hash.clone(),
            };
            assert!(
                matches!(ctx.decrypt_message(&tampered), Err(SecurityError::Integrity)),
                "flip at byte {} slipped through",
                byte
            );
        }
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let sender = context();
        let receiver = context();
        let envelope = sender.encrypt_message(&json!({"type": "data"})).unwrap();

        // Hash is over ciphertext, so it still matches; only AEAD fails.
        assert!(matches!(
            receiver.decrypt_message(&envelope),
            Err(SecurityError::Decryption(_))
        ));
    }

    #[test]
    fn invalid_key_length_rejected() {
        let short = BASE64.encode(b"too-short");
        assert!(matches!(
            SecurityContext::from_base64_key(&short),
            Err(SecurityError::InvalidKey(_))
        ));
    }

    #[test]
    fn base64_key_round_trip() {
        let key = SecurityContext::generate_base64_key();
        let ctx = SecurityContext::from_base64_key(&key).unwrap();
        let envelope = ctx.encrypt_message(&json!({"ok": true})).unwrap();
        assert_eq!(ctx.decrypt_message(&envelope).unwrap(), json!({"ok": true}));
    }
}
