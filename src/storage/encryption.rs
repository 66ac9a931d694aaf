use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::common::{ClusterError, ClusterResult};

pub const NOTHING_ENCRYPTION: &str = "nothing";
pub const AES_GCM_ENCRYPTION: &str = "aes/gcm";

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Byte-to-byte transform applied after compression on write and before
/// decompression on read.
pub trait Encryption: Send + Sync {
    fn name(&self) -> &'static str;
    fn encrypt(&self, content: &[u8]) -> ClusterResult<Vec<u8>>;
    fn decrypt(&self, content: &[u8]) -> ClusterResult<Vec<u8>>;
}

pub struct NothingEncryption;

impl Encryption for NothingEncryption {
    fn name(&self) -> &'static str {
        NOTHING_ENCRYPTION
    }

    fn encrypt(&self, content: &[u8]) -> ClusterResult<Vec<u8>> {
        Ok(content.to_vec())
    }

    fn decrypt(&self, content: &[u8]) -> ClusterResult<Vec<u8>> {
        Ok(content.to_vec())
    }
}

/// AES-256-GCM with a random nonce prepended to every ciphertext.
pub struct AesGcmEncryption {
    cipher: Aes256Gcm,
}

impl AesGcmEncryption {
    pub fn new(key: &[u8]) -> ClusterResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(ClusterError::InvalidAttribute(format!(
                "aes/gcm encryption requires a {}-byte key, got {} bytes",
                KEY_SIZE,
                key.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }
}

impl Encryption for AesGcmEncryption {
    fn name(&self) -> &'static str {
        AES_GCM_ENCRYPTION
    }

    fn encrypt(&self, content: &[u8]) -> ClusterResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, content)
            .map_err(|_| ClusterError::Storage("record encryption failed".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, content: &[u8]) -> ClusterResult<Vec<u8>> {
        if content.len() < NONCE_SIZE {
            return Err(ClusterError::Storage(
                "record content is broken: ciphertext shorter than nonce".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = content.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ClusterError::Storage("record decryption failed".to_string()))
    }
}

pub fn encryption_by_name(name: &str, key: Option<&[u8]>) -> ClusterResult<Arc<dyn Encryption>> {
    match name {
        NOTHING_ENCRYPTION => Ok(Arc::new(NothingEncryption)),
        AES_GCM_ENCRYPTION => {
            let key = key.ok_or_else(|| {
                ClusterError::InvalidAttribute(
                    "aes/gcm encryption requires an encryption key".to_string(),
                )
            })?;
            Ok(Arc::new(AesGcmEncryption::new(key)?))
        }
        other => Err(ClusterError::InvalidAttribute(format!(
            "unknown encryption method '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_gcm_roundtrip() {
        let enc = AesGcmEncryption::new(&[7u8; 32]).unwrap();
        let content = b"some secret record payload".to_vec();
        let sealed = enc.encrypt(&content).unwrap();
        assert_ne!(sealed, content);
        assert_eq!(enc.decrypt(&sealed).unwrap(), content);
    }

    #[test]
    fn test_aes_gcm_wrong_key_fails() {
        let enc = AesGcmEncryption::new(&[7u8; 32]).unwrap();
        let other = AesGcmEncryption::new(&[8u8; 32]).unwrap();
        let sealed = enc.encrypt(b"payload").unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_aes_gcm_key_size_checked() {
        assert!(AesGcmEncryption::new(&[1u8; 16]).is_err());
        assert!(encryption_by_name(AES_GCM_ENCRYPTION, None).is_err());
    }

    #[test]
    fn test_lookup_by_name() {
        assert!(encryption_by_name("nothing", None).is_ok());
        assert!(encryption_by_name("rot13", None).is_err());
    }
}
