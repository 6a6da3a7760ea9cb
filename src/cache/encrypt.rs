// =============================================================================
// Encryption wrapper — authenticated encryption over designated namespaces
// =============================================================================
//
// Applies AES-256-GCM to values written to `auth` / `api_keys` / `tokens`
// (see `namespace::ENCRYPTED`); every other namespace passes through
// unmodified. A wrong key (or corrupted ciphertext) surfaces as "absent"
// with an error log rather than an error return.
// =============================================================================

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use tracing::warn;

use super::{namespace, CacheBackend, CacheValue};

const NONCE_LEN: usize = 12;

pub struct EncryptedCache<B: CacheBackend> {
    inner: B,
    cipher: Aes256Gcm,
}

impl<B: CacheBackend> EncryptedCache<B> {
    /// `key` must be exactly 32 bytes (AES-256). Typically loaded from the
    /// file path named by the `encryption-key file path` environment knob.
    pub fn new(inner: B, key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self { inner, cipher }
    }

    fn applies_to(namespace: &str) -> bool {
        namespace::ENCRYPTED.contains(&namespace)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("AES-GCM encryption failed");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    fn decrypt(&self, blob: &[u8]) -> Option<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            warn!("encrypted cache entry too short to contain a nonce");
            return None;
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        match self.cipher.decrypt(nonce, ciphertext) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                warn!(error = %e, "encrypted cache entry failed to decrypt — treating as absent");
                None
            }
        }
    }
}

#[async_trait]
impl<B: CacheBackend> CacheBackend for EncryptedCache<B> {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<CacheValue> {
        let raw = self.inner.get(namespace, key).await?;
        if !Self::applies_to(namespace) {
            return Ok(raw);
        }
        Ok(raw.and_then(|blob| self.decrypt(&blob)))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let stored = if Self::applies_to(namespace) {
            self.encrypt(&value)
        } else {
            value
        };
        self.inner.set(namespace, key, stored, ttl).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        self.inner.delete(namespace, key).await
    }

    async fn clear(&self, namespace: &str) -> anyhow::Result<()> {
        self.inner.clear(namespace).await
    }

    async fn size(&self, namespace: &str) -> anyhow::Result<usize> {
        self.inner.size(namespace).await
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryBackend;

    fn test_key() -> [u8; 32] {
        *b"0123456789abcdef0123456789abcde"
    }

    #[tokio::test]
    async fn roundtrip_on_encrypted_namespace() {
        let cache = EncryptedCache::new(MemoryBackend::new(10), &test_key());
        cache
            .set(namespace::AUTH, "u1", b"secret-token".to_vec(), None)
            .await
            .unwrap();
        let got = cache.get(namespace::AUTH, "u1").await.unwrap();
        assert_eq!(got, Some(b"secret-token".to_vec()));
    }

    #[tokio::test]
    async fn unencrypted_namespace_passes_through_in_plaintext() {
        let cache = EncryptedCache::new(MemoryBackend::new(10), &test_key());
        cache
            .set(namespace::SYMBOLS, "k", b"plain".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(
            cache.get(namespace::SYMBOLS, "k").await.unwrap(),
            Some(b"plain".to_vec())
        );
    }

    #[tokio::test]
    async fn wrong_key_surfaces_as_absent() {
        let right = EncryptedCache::new(MemoryBackend::new(10), &test_key());
        let other_key = *b"zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz";
        let wrong = EncryptedCache::new(MemoryBackend::new(10), &other_key);

        let ciphertext = right.encrypt(b"top secret");
        assert!(wrong.decrypt(&ciphertext).is_none());
        assert_eq!(right.decrypt(&ciphertext), Some(b"top secret".to_vec()));
    }
}
