//! Per-DEK lease bookkeeping
//!
//! A key context couples a DEK's encryptor with its remaining-encryption
//! budget, expiry deadline and destroyed flag. The owning mutex serializes
//! the triple; reservation and encryption happen under the same lock so IV
//! uniqueness and budget accounting stay atomic with each other.

use bytes::{Bytes, BytesMut};
use std::time::Instant;

use super::cipher::AesGcmEncryptor;
use crate::error::EncryptionError;

/// Lease state for one active DEK
pub struct KeyContext {
    serialized_edek: Bytes,
    expiry: Instant,
    remaining_encryptions: u64,
    encryptor: Option<AesGcmEncryptor>,
    destroyed: bool,
}

impl KeyContext {
    pub fn new(
        serialized_edek: Bytes,
        expiry: Instant,
        max_encryptions: u64,
        encryptor: AesGcmEncryptor,
    ) -> Self {
        Self {
            serialized_edek,
            expiry,
            remaining_encryptions: max_encryptions,
            encryptor: Some(encryptor),
            destroyed: false,
        }
    }

    pub fn serialized_edek(&self) -> &Bytes {
        &self.serialized_edek
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiry
    }

    pub fn remaining_encryptions(&self) -> u64 {
        self.remaining_encryptions
    }

    pub fn has_at_least_remaining_encryptions(&self, n: u64) -> bool {
        self.remaining_encryptions >= n
    }

    /// Reserve budget for `n` encryptions. Must have been checked with
    /// [`Self::has_at_least_remaining_encryptions`] under the same lock.
    pub fn reserve_encryptions(&mut self, n: u64) -> Result<(), EncryptionError> {
        if self.destroyed {
            return Err(EncryptionError::RequestNotSatisfiable(
                "key context already destroyed".to_string(),
            ));
        }
        if self.remaining_encryptions < n {
            return Err(EncryptionError::RequestNotSatisfiable(format!(
                "{} encryptions requested, {} remaining",
                n, self.remaining_encryptions
            )));
        }
        self.remaining_encryptions -= n;
        Ok(())
    }

    /// The on-wire size of an encrypted parcel of the given size
    pub fn encoded_size(&self, parcel_size: usize) -> usize {
        AesGcmEncryptor::encoded_size(parcel_size)
    }

    /// Encrypt under the reserved budget. Panics are not possible on a
    /// destroyed context because the encryptor is gone and an error is
    /// returned instead.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), EncryptionError> {
        match self.encryptor.as_mut() {
            Some(encryptor) => encryptor.encrypt(plaintext, aad, out),
            None => Err(EncryptionError::RequestNotSatisfiable(
                "key context destroyed".to_string(),
            )),
        }
    }

    /// Destroy the context: the encryptor (and with it the DEK key
    /// schedule) is dropped and the DEK material zeroized. The serialized
    /// EDEK stays readable; records already written reference it and it
    /// only unlocks through the KMS.
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.remaining_encryptions = 0;
        self.encryptor = None;
    }
}
