//! AES-GCM encryptor with collision-free IV generation
//!
//! One encryptor belongs to one DEK. IVs start from a random 96-bit value
//! and increment per encryption, so no two encryptions under the same DEK
//! can share an IV within the DEK's capped encryption budget.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::{BufMut, BytesMut};
use rand::RngCore;

use crate::error::EncryptionError;
use crate::kms::Dek;

/// AES-GCM IV size in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Generates unique 96-bit IVs: a random starting point, then a counter.
pub struct AesGcmIvGenerator {
    high: u32,
    low: u64,
}

impl AesGcmIvGenerator {
    pub fn new() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            high: rng.next_u32(),
            low: rng.next_u64(),
        }
    }

    /// Write the next IV into `out`
    pub fn next_iv(&mut self, out: &mut [u8; IV_SIZE]) {
        out[..4].copy_from_slice(&self.high.to_be_bytes());
        out[4..].copy_from_slice(&self.low.to_be_bytes());
        let (low, carry) = self.low.overflowing_add(1);
        self.low = low;
        if carry {
            self.high = self.high.wrapping_add(1);
        }
    }
}

impl Default for AesGcmIvGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A stateful AES-256-GCM encryptor/decryptor bound to one DEK
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
    iv_generator: Option<AesGcmIvGenerator>,
}

impl AesGcmEncryptor {
    /// Build an encryptor; only this constructor provides an IV source.
    pub fn for_encrypt(
        iv_generator: AesGcmIvGenerator,
        dek: &Dek,
    ) -> Result<Self, EncryptionError> {
        Ok(Self {
            cipher: new_cipher(dek)?,
            iv_generator: Some(iv_generator),
        })
    }

    /// Build a decryptor
    pub fn for_decrypt(dek: &Dek) -> Result<Self, EncryptionError> {
        Ok(Self {
            cipher: new_cipher(dek)?,
            iv_generator: None,
        })
    }

    /// The on-wire size of an encrypted payload: IV, ciphertext, tag
    pub fn encoded_size(plaintext_len: usize) -> usize {
        IV_SIZE + plaintext_len + TAG_SIZE
    }

    /// Encrypt `plaintext` and append `iv | ciphertext | tag` to `out`.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), EncryptionError> {
        let generator = self
            .iv_generator
            .as_mut()
            .ok_or_else(|| EncryptionError::Cipher("encryptor built for decrypt".to_string()))?;
        let mut iv = [0u8; IV_SIZE];
        generator.next_iv(&mut iv);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::Cipher("AES-GCM encryption failed".to_string()))?;

        out.put_slice(&iv);
        out.put_slice(&ciphertext);
        Ok(())
    }

    /// Decrypt `iv | ciphertext | tag` produced by [`Self::encrypt`].
    pub fn decrypt(&self, encoded: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if encoded.len() < IV_SIZE + TAG_SIZE {
            return Err(EncryptionError::Truncated(
                "encrypted payload shorter than IV plus tag".to_string(),
            ));
        }
        let (iv, ciphertext) = encoded.split_at(IV_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::Cipher("AES-GCM tag verification failed".to_string()))
    }
}

fn new_cipher(dek: &Dek) -> Result<Aes256Gcm, EncryptionError> {
    Aes256Gcm::new_from_slice(dek.as_bytes())
        .map_err(|_| EncryptionError::Cipher(format!("unsupported DEK size {}", dek.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dek() -> Dek {
        let mut material = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        Dek::new(material)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let dek = dek();
        let mut encryptor = AesGcmEncryptor::for_encrypt(AesGcmIvGenerator::new(), &dek).unwrap();
        let decryptor = AesGcmEncryptor::for_decrypt(&dek).unwrap();

        let mut out = BytesMut::new();
        encryptor.encrypt(b"payload", &[], &mut out).unwrap();
        assert_eq!(out.len(), AesGcmEncryptor::encoded_size(7));

        let plaintext = decryptor.decrypt(&out, &[]).unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn test_tampered_ciphertext_fails_verification() {
        let dek = dek();
        let mut encryptor = AesGcmEncryptor::for_encrypt(AesGcmIvGenerator::new(), &dek).unwrap();
        let decryptor = AesGcmEncryptor::for_decrypt(&dek).unwrap();

        let mut out = BytesMut::new();
        encryptor.encrypt(b"payload", &[], &mut out).unwrap();
        out[IV_SIZE + 2] ^= 0x40;
        assert!(decryptor.decrypt(&out, &[]).is_err());
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let mut encryptor =
            AesGcmEncryptor::for_encrypt(AesGcmIvGenerator::new(), &dek()).unwrap();
        let other = AesGcmEncryptor::for_decrypt(&dek()).unwrap();
        let mut out = BytesMut::new();
        encryptor.encrypt(b"payload", &[], &mut out).unwrap();
        assert!(other.decrypt(&out, &[]).is_err());
    }

    #[test]
    fn test_iv_uniqueness_over_many_encryptions() {
        let mut generator = AesGcmIvGenerator::new();
        let mut seen = std::collections::HashSet::new();
        let mut iv = [0u8; IV_SIZE];
        for _ in 0..10_000 {
            generator.next_iv(&mut iv);
            assert!(seen.insert(iv), "IV repeated");
        }
    }

    #[test]
    fn test_iv_counter_carries_across_low_word() {
        let mut generator = AesGcmIvGenerator {
            high: 1,
            low: u64::MAX,
        };
        let mut first = [0u8; IV_SIZE];
        let mut second = [0u8; IV_SIZE];
        generator.next_iv(&mut first);
        generator.next_iv(&mut second);
        assert_ne!(first, second);
        assert_eq!(&second[..4], &2u32.to_be_bytes());
    }

    #[test]
    fn test_decryptor_cannot_encrypt() {
        let decryptor = AesGcmEncryptor::for_decrypt(&dek());
        let mut decryptor = decryptor.unwrap();
        let mut out = BytesMut::new();
        assert!(decryptor.encrypt(b"x", &[], &mut out).is_err());
    }
}
