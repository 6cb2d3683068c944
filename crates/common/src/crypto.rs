//! Optional client-side encryption and content hashing.
//!
//! Objects are sealed with AES-256-GCM under a key derived from the user's
//! password via PBKDF2-HMAC-SHA256. The wire format is
//! `nonce (12) || tag (16) || ciphertext`, so a payload shorter than 28
//! bytes can never be valid. Every device sharing a bucket derives the same
//! key from the same password; the salt is a deterministic function of the
//! password itself.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use crate::config::EncryptionConfig;
use crate::error::{Result, SyncError};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const PBKDF2_ROUNDS: u32 = 100_000;

/// Hex-encoded SHA-256 of plaintext content. This is the identity used for
/// change detection and conflict comparison, always computed over the
/// plaintext regardless of encryption.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Encrypts payloads on the way to the bucket and authenticates them on the
/// way back. With encryption disabled this is an identity transform, which
/// keeps the sync engine's data path uniform.
pub struct CipherPipeline {
    cipher: Option<Aes256Gcm>,
    key: [u8; 32],
}

impl std::fmt::Debug for CipherPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherPipeline")
            .field("enabled", &self.cipher.is_some())
            .finish()
    }
}

impl CipherPipeline {
    pub fn new(config: &EncryptionConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self {
                cipher: None,
                key: [0u8; 32],
            });
        }
        if config.password.is_empty() {
            return Err(SyncError::Config(
                "encryption is enabled but no password is set".to_string(),
            ));
        }
        if config.algorithm != "aes-256-gcm" {
            return Err(SyncError::Config(format!(
                "unsupported encryption algorithm: {}",
                config.algorithm
            )));
        }
        let key = derive_key(&config.password);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(Self {
            cipher: Some(cipher),
            key,
        })
    }

    pub fn disabled() -> Self {
        Self {
            cipher: None,
            key: [0u8; 32],
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seals plaintext for upload. A fresh random nonce per call; the same
    /// plaintext encrypts to a different payload every time.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SyncError::Integrity("encryption failed".to_string()))?;
        // aes-gcm appends the tag; reorder to nonce || tag || ciphertext.
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(tag);
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Opens a downloaded payload. Authentication failure means the object
    /// was tampered with or sealed under a different password; the caller
    /// quarantines it rather than serving garbage.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(payload.to_vec());
        };
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(SyncError::Integrity(format!(
                "payload too short to be sealed content: {} bytes",
                payload.len()
            )));
        }
        let (nonce, rest) = payload.split_at(NONCE_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);
        let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
            .map_err(|_| SyncError::Integrity("ciphertext failed authentication".to_string()))
    }

    /// Whether a password derives the same key this pipeline was built
    /// with. Used at mount time to reject a typo before it manifests as a
    /// bucket full of quarantined files.
    pub fn verify_password(&self, password: &str) -> bool {
        self.cipher.is_some() && derive_key(password) == self.key
    }
}

/// PBKDF2-HMAC-SHA256, 100k rounds, salt deterministically derived from the
/// password so independent devices agree on the key without a key exchange.
fn derive_key(password: &str) -> [u8; 32] {
    let salt_digest = Sha256::digest(password.as_bytes());
    let salt = &salt_digest[..16];
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(password: &str) -> CipherPipeline {
        CipherPipeline::new(&EncryptionConfig {
            enabled: true,
            password: password.to_string(),
            algorithm: "aes-256-gcm".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let p = pipeline("correct horse battery staple");
        let sealed = p.encrypt(b"attack at dawn").unwrap();
        assert_ne!(sealed, b"attack at dawn");
        assert!(sealed.len() >= NONCE_LEN + TAG_LEN);
        assert_eq!(p.decrypt(&sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let p = pipeline("pw");
        let mut sealed = p.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(p.decrypt(&sealed), Err(SyncError::Integrity(_))));
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let sealed = pipeline("alpha").encrypt(b"secret").unwrap();
        assert!(matches!(
            pipeline("beta").decrypt(&sealed),
            Err(SyncError::Integrity(_))
        ));
    }

    #[test]
    fn test_short_payload_is_rejected() {
        let p = pipeline("pw");
        assert!(matches!(
            p.decrypt(&[0u8; 27]),
            Err(SyncError::Integrity(_))
        ));
    }

    #[test]
    fn test_disabled_is_identity() {
        let p = CipherPipeline::disabled();
        assert!(!p.is_enabled());
        assert_eq!(p.encrypt(b"plain").unwrap(), b"plain");
        assert_eq!(p.decrypt(b"plain").unwrap(), b"plain");
    }

    #[test]
    fn test_verify_password() {
        let p = pipeline("alpha");
        assert!(p.verify_password("alpha"));
        assert!(!p.verify_password("beta"));
        assert!(!CipherPipeline::disabled().verify_password("alpha"));
    }

    #[test]
    fn test_same_password_derives_same_key_across_pipelines() {
        let sealed = pipeline("shared").encrypt(b"cross-device").unwrap();
        assert_eq!(pipeline("shared").decrypt(&sealed).unwrap(), b"cross-device");
    }

    #[test]
    fn test_enabled_without_password_is_rejected() {
        let result = CipherPipeline::new(&EncryptionConfig {
            enabled: true,
            password: String::new(),
            algorithm: "aes-256-gcm".to_string(),
        });
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_content_hash_is_stable_hex_sha256() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
