//! The KMS contract consumed by the envelope-encryption filter
//!
//! The proxy never sees key-encryption keys: it asks the KMS for a
//! `(DEK, EDEK)` pair, uses the DEK locally for a bounded number of
//! encryptions, and stores the opaque EDEK in-band next to the ciphertext.
//! Decryption sends the EDEK back to the KMS.

pub mod memory;

pub use memory::InMemoryKms;

use async_trait::async_trait;
use bytes::BytesMut;
use zeroize::Zeroizing;

use crate::error::KmsError;

/// A data-encryption key. Key material is zeroized on drop.
pub struct Dek(Zeroizing<Vec<u8>>);

impl Dek {
    pub fn new(material: Vec<u8>) -> Self {
        Self(Zeroizing::new(material))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dek({} bytes)", self.0.len())
    }
}

/// A freshly generated DEK together with its KMS-wrapped form
pub struct DekPair<E> {
    pub dek: Dek,
    pub edek: E,
}

/// Serde for the opaque EDEK type, declared by the KMS
pub trait EdekSerde<E>: Send + Sync {
    fn size_of(&self, edek: &E) -> usize;
    fn serialize(&self, edek: &E, buf: &mut BytesMut);
    fn deserialize(&self, buf: &[u8]) -> Result<E, KmsError>;
}

/// A Key Management Service.
///
/// Implementations must be thread-safe; calls may be issued from any
/// connection concurrently. The proxy applies no timeout of its own, the
/// KMS client is expected to enforce one.
#[async_trait]
pub trait Kms: Send + Sync + 'static {
    /// Opaque KEK identifier
    type KekId: Clone + Eq + std::hash::Hash + Send + Sync + std::fmt::Debug + 'static;
    /// Opaque wrapped-DEK form
    type Edek: Clone + Send + Sync + 'static;

    /// Generate a fresh DEK under the given KEK
    async fn generate_dek_pair(
        &self,
        kek_id: &Self::KekId,
    ) -> Result<DekPair<Self::Edek>, KmsError>;

    /// Unwrap an EDEK back into the DEK
    async fn decrypt_edek(&self, edek: &Self::Edek) -> Result<Dek, KmsError>;

    /// Resolve a KEK alias (e.g. derived from a topic name) to a KEK id
    async fn resolve_kek_id(&self, alias: &str) -> Result<Self::KekId, KmsError>;

    /// The serde used to store EDEKs in-band
    fn edek_serde(&self) -> &dyn EdekSerde<Self::Edek>;
}
