//! In-memory KMS for development and tests
//!
//! KEKs are held in process memory; EDEKs are AES-256-GCM wrappings of the
//! DEK under the named KEK, prefixed with the KEK name so they can be
//! unwrapped without external state. Call counters expose the KMS
//! interaction pattern to tests.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Dek, DekPair, EdekSerde, Kms};
use crate::error::KmsError;

const DEK_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// An in-memory KMS keyed by KEK name
pub struct InMemoryKms {
    keks: DashMap<String, [u8; 32]>,
    serde: VecEdekSerde,
    generate_calls: AtomicU64,
    decrypt_calls: AtomicU64,
}

impl InMemoryKms {
    pub fn new() -> Self {
        Self {
            keks: DashMap::new(),
            serde: VecEdekSerde,
            generate_calls: AtomicU64::new(0),
            decrypt_calls: AtomicU64::new(0),
        }
    }

    /// Create a KEK with random material under the given name
    pub fn create_kek(&self, name: impl Into<String>) {
        let mut material = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        self.keks.insert(name.into(), material);
    }

    /// Number of generate_dek_pair calls issued so far
    pub fn generate_dek_calls(&self) -> u64 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Number of decrypt_edek calls issued so far
    pub fn decrypt_edek_calls(&self) -> u64 {
        self.decrypt_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryKms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Kms for InMemoryKms {
    type KekId = String;
    type Edek = Vec<u8>;

    async fn generate_dek_pair(&self, kek_id: &String) -> Result<DekPair<Vec<u8>>, KmsError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let kek = self
            .keks
            .get(kek_id)
            .ok_or_else(|| KmsError::UnknownKey(kek_id.clone()))?;

        let mut dek_material = vec![0u8; DEK_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut dek_material);
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new_from_slice(kek.value())
            .map_err(|e| KmsError::Unavailable(format!("bad KEK material: {e}")))?;
        let wrapped = cipher
            .encrypt(Nonce::from_slice(&nonce), dek_material.as_slice())
            .map_err(|_| KmsError::Unavailable("DEK wrap failed".to_string()))?;

        // edek = u16 name length | name | nonce | wrapped dek
        let name = kek_id.as_bytes();
        let mut edek = BytesMut::with_capacity(2 + name.len() + NONCE_SIZE + wrapped.len());
        edek.put_u16(name.len() as u16);
        edek.put_slice(name);
        edek.put_slice(&nonce);
        edek.put_slice(&wrapped);

        Ok(DekPair {
            dek: Dek::new(dek_material),
            edek: edek.to_vec(),
        })
    }

    async fn decrypt_edek(&self, edek: &Vec<u8>) -> Result<Dek, KmsError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        if edek.len() < 2 {
            return Err(KmsError::InvalidEdek("truncated".to_string()));
        }
        let name_len = u16::from_be_bytes([edek[0], edek[1]]) as usize;
        if edek.len() < 2 + name_len + NONCE_SIZE {
            return Err(KmsError::InvalidEdek("truncated".to_string()));
        }
        let name = std::str::from_utf8(&edek[2..2 + name_len])
            .map_err(|_| KmsError::InvalidEdek("bad KEK name".to_string()))?;
        let kek = self
            .keks
            .get(name)
            .ok_or_else(|| KmsError::UnknownKey(name.to_string()))?;

        let nonce = &edek[2 + name_len..2 + name_len + NONCE_SIZE];
        let wrapped = &edek[2 + name_len + NONCE_SIZE..];
        let cipher = Aes256Gcm::new_from_slice(kek.value())
            .map_err(|e| KmsError::Unavailable(format!("bad KEK material: {e}")))?;
        let dek_material = cipher
            .decrypt(Nonce::from_slice(nonce), wrapped)
            .map_err(|_| KmsError::InvalidEdek("unwrap failed".to_string()))?;
        Ok(Dek::new(dek_material))
    }

    async fn resolve_kek_id(&self, alias: &str) -> Result<String, KmsError> {
        if self.keks.contains_key(alias) {
            Ok(alias.to_string())
        } else {
            Err(KmsError::UnknownAlias(alias.to_string()))
        }
    }

    fn edek_serde(&self) -> &dyn EdekSerde<Vec<u8>> {
        &self.serde
    }
}

/// EDEKs of the in-memory KMS are already plain byte vectors
pub struct VecEdekSerde;

impl EdekSerde<Vec<u8>> for VecEdekSerde {
    fn size_of(&self, edek: &Vec<u8>) -> usize {
        edek.len()
    }

    fn serialize(&self, edek: &Vec<u8>, buf: &mut BytesMut) {
        buf.put_slice(edek);
    }

    fn deserialize(&self, buf: &[u8]) -> Result<Vec<u8>, KmsError> {
        Ok(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_and_unwrap_roundtrip() {
        let kms = InMemoryKms::new();
        kms.create_kek("kek-1");

        let kek_id = kms.resolve_kek_id("kek-1").await.unwrap();
        let pair = kms.generate_dek_pair(&kek_id).await.unwrap();
        assert_eq!(pair.dek.len(), DEK_SIZE);

        let unwrapped = kms.decrypt_edek(&pair.edek).await.unwrap();
        assert_eq!(unwrapped.as_bytes(), pair.dek.as_bytes());
        assert_eq!(kms.generate_dek_calls(), 1);
        assert_eq!(kms.decrypt_edek_calls(), 1);
    }

    #[tokio::test]
    async fn test_each_generate_yields_a_fresh_dek() {
        let kms = InMemoryKms::new();
        kms.create_kek("kek-1");
        let kek_id = "kek-1".to_string();
        let a = kms.generate_dek_pair(&kek_id).await.unwrap();
        let b = kms.generate_dek_pair(&kek_id).await.unwrap();
        assert_ne!(a.dek.as_bytes(), b.dek.as_bytes());
        assert_ne!(a.edek, b.edek);
    }

    #[tokio::test]
    async fn test_unknown_kek_is_rejected() {
        let kms = InMemoryKms::new();
        assert!(matches!(
            kms.resolve_kek_id("missing").await,
            Err(KmsError::UnknownAlias(_))
        ));
        assert!(matches!(
            kms.generate_dek_pair(&"missing".to_string()).await,
            Err(KmsError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_edek_fails_unwrap() {
        let kms = InMemoryKms::new();
        kms.create_kek("kek-1");
        let mut pair = kms
            .generate_dek_pair(&"kek-1".to_string())
            .await
            .unwrap();
        let last = pair.edek.len() - 1;
        pair.edek[last] ^= 0x01;
        assert!(kms.decrypt_edek(&pair.edek).await.is_err());
    }
}
