//! Envelope encryption key manager
//!
//! Stores the encrypted DEK alongside each record ("in-band"): the
//! transformed record value is a wrapper of
//!
//! ```text
//! uvarint edek_length | edek | u8 aad_code | u8 cipher_code
//!     | iv | ciphertext | auth_tag
//! ```
//!
//! and an `kroxylicious.io/encryption` record header carries the one-byte
//! encryption version a reader must expect.
//!
//! DEKs are leased from a coalescing cache per KEK: an encrypt call
//! reserves budget for its whole batch under the context lock, rotating
//! the DEK when the budget or TTL is exhausted, and gives up with
//! `RequestNotSatisfiable` after three attempts.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::indexmap::IndexMap;
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::Record;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::batch::{decode_batch, encode_batch, BatchMeta};
use super::buffer_pool::BufferPool;
use super::cache::LoadingCache;
use super::cipher::{AesGcmEncryptor, AesGcmIvGenerator};
use super::key_context::KeyContext;
use super::parcel::{self, get_uvarint, put_uvarint, size_of_uvarint};
use super::scheme::{AadSpec, CipherCode, EncryptionScheme, EncryptionVersion, RecordFieldSet};
use crate::error::EncryptionError;
use crate::kms::Kms;
use crate::metrics;

/// The record header naming the encryption version of the wrapper
pub const ENCRYPTION_HEADER_NAME: &str = "kroxylicious.io/encryption";

/// DEK lease attempts before an encrypt call gives up
const MAX_ATTEMPTS: usize = 3;

/// Default DEK lifetime
pub const DEFAULT_DEK_TTL: Duration = Duration::from_secs(5);

/// Default encryption budget per DEK
pub const DEFAULT_MAX_ENCRYPTIONS_PER_DEK: u64 = 500_000;

type SharedKeyContext = Arc<Mutex<KeyContext>>;
type SharedDecryptor = Arc<Mutex<AesGcmEncryptor>>;

/// Key manager performing in-band envelope encryption of record batches
pub struct InBandKeyManager<M: Kms> {
    kms: Arc<M>,
    pool: Arc<BufferPool>,
    dek_cache: LoadingCache<M::KekId, SharedKeyContext, EncryptionError>,
    decryptor_cache: LoadingCache<Bytes, SharedDecryptor, EncryptionError>,
    dek_ttl: Duration,
    max_encryptions_per_dek: u64,
    encryption_version: EncryptionVersion,
}

impl<M: Kms> InBandKeyManager<M> {
    pub fn new(kms: Arc<M>, pool: Arc<BufferPool>) -> Self {
        Self::with_limits(kms, pool, DEFAULT_MAX_ENCRYPTIONS_PER_DEK, DEFAULT_DEK_TTL)
    }

    pub fn with_limits(
        kms: Arc<M>,
        pool: Arc<BufferPool>,
        max_encryptions_per_dek: u64,
        dek_ttl: Duration,
    ) -> Self {
        Self {
            kms,
            pool,
            dek_cache: LoadingCache::new(),
            decryptor_cache: LoadingCache::new(),
            dek_ttl,
            max_encryptions_per_dek,
            encryption_version: EncryptionVersion::V1,
        }
    }

    /// Encrypt the records of `batch` under the scheme's KEK.
    ///
    /// Batches with no bytes, no records (fully compacted away) or only
    /// tombstones are returned byte-identical without touching the KMS.
    pub async fn encrypt(
        &self,
        topic: &str,
        partition: i32,
        scheme: &EncryptionScheme<M::KekId>,
        batch: Bytes,
    ) -> Result<Bytes, EncryptionError> {
        if batch.is_empty() {
            return Ok(batch);
        }
        let meta = BatchMeta::peek(&batch)?;
        if meta.magic < 2 {
            return Err(EncryptionError::UnsupportedMagic(meta.magic));
        }
        let records = decode_batch(&batch)?;
        if records.is_empty() {
            return Ok(batch);
        }

        // Structural validation up front so an invalid batch fails whole,
        // with no partial output and no budget consumed
        if scheme
            .record_fields
            .contains(RecordFieldSet::RECORD_HEADER_VALUES)
        {
            for record in &records {
                if record.value.is_none() && !record.headers.is_empty() {
                    return Err(EncryptionError::HeaderEncryptionOnTombstone {
                        topic: topic.to_string(),
                        partition,
                    });
                }
            }
        }
        if records.iter().all(|r| r.value.is_none()) {
            return Ok(batch);
        }

        let batch_size = records.len() as u64;
        for _attempt in 0..MAX_ATTEMPTS {
            let context = self
                .dek_cache
                .get_or_load(&scheme.kek_id, || self.make_key_context(&scheme.kek_id))
                .await?;

            let mut guard = context.lock();
            if guard.is_destroyed() {
                // A previous encrypt rotated this context out of the cache
                // between our load and lock; retry drives a fresh load
                continue;
            }
            if guard.is_expired(Instant::now())
                || !guard.has_at_least_remaining_encryptions(batch_size)
            {
                guard.destroy();
                self.dek_cache.invalidate(&scheme.kek_id);
                metrics::record_dek_rotation();
                debug!(topic, partition, "rotating exhausted or expired DEK");
                continue;
            }

            // Budget reservation and encryption stay under one lock so IV
            // uniqueness and the remaining counter move together
            guard.reserve_encryptions(batch_size)?;
            let out = self.encrypt_records(&mut guard, scheme, records, meta)?;
            return Ok(out);
        }

        Err(EncryptionError::RequestNotSatisfiable(format!(
            "failed to reserve a DEK to encrypt {batch_size} records for topic {topic} \
             partition {partition} after {MAX_ATTEMPTS} attempts"
        )))
    }

    fn make_key_context(
        &self,
        kek_id: &M::KekId,
    ) -> impl std::future::Future<Output = Result<SharedKeyContext, EncryptionError>> + Send + 'static
    {
        let kms = self.kms.clone();
        let kek_id = kek_id.clone();
        let ttl = self.dek_ttl;
        let max_encryptions = self.max_encryptions_per_dek;
        async move {
            let pair = kms.generate_dek_pair(&kek_id).await?;
            metrics::record_kms_generate_dek();
            let serde = kms.edek_serde();
            let mut serialized = BytesMut::with_capacity(serde.size_of(&pair.edek));
            serde.serialize(&pair.edek, &mut serialized);
            let encryptor = AesGcmEncryptor::for_encrypt(AesGcmIvGenerator::new(), &pair.dek)?;
            Ok(Arc::new(Mutex::new(KeyContext::new(
                serialized.freeze(),
                Instant::now() + ttl,
                max_encryptions,
                encryptor,
            ))))
        }
    }

    fn encrypt_records(
        &self,
        context: &mut KeyContext,
        scheme: &EncryptionScheme<M::KekId>,
        records: Vec<Record>,
        meta: BatchMeta,
    ) -> Result<Bytes, EncryptionError> {
        let parcel_version = self.encryption_version.parcel_version();
        let fields = scheme.record_fields;

        let max_parcel_size = records
            .iter()
            .filter(|r| r.value.is_some())
            .map(|r| parcel::size_of_parcel(parcel_version, fields, r))
            .max()
            .unwrap_or(0);
        let max_wrapper_size = self.size_of_wrapper(context, max_parcel_size);

        let mut parcel_buf = self.pool.acquire(max_parcel_size);
        let mut wrapper_buf = self.pool.acquire(max_wrapper_size);

        let mut encrypted = 0u64;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            if record.value.is_none() {
                // Tombstones pass through unchanged
                out.push(record);
                continue;
            }
            parcel_buf.clear();
            parcel::write_parcel(parcel_version, fields, &record, &mut parcel_buf)?;

            wrapper_buf.clear();
            let edek = context.serialized_edek().clone();
            put_uvarint(&mut wrapper_buf, edek.len() as u64);
            wrapper_buf.put_slice(&edek);
            wrapper_buf.put_u8(AadSpec::None.code());
            wrapper_buf.put_u8(CipherCode::AesGcm96_128.code());
            context.encrypt(&parcel_buf, AadSpec::None.bytes(), &mut wrapper_buf)?;

            let headers = self.transform_headers(fields, &record);
            // The emitted value must outlive the borrowed wrapper buffer,
            // so it is copied out on emit
            let value = Bytes::copy_from_slice(&wrapper_buf);
            encrypted += 1;
            out.push(Record {
                value: Some(value),
                headers,
                ..record
            });
        }

        metrics::record_encryptions(encrypted);
        encode_batch(&out, meta.compression)
    }

    /// Wrapper size as a pure function of the maximum parcel size
    fn size_of_wrapper(&self, context: &KeyContext, parcel_size: usize) -> usize {
        let edek_len = context.serialized_edek().len();
        size_of_uvarint(edek_len as u64) + edek_len + 1 + 1 + context.encoded_size(parcel_size)
    }

    fn transform_headers(
        &self,
        fields: RecordFieldSet,
        record: &Record,
    ) -> IndexMap<StrBytes, Option<Bytes>> {
        let mut headers = IndexMap::with_capacity(1 + record.headers.len());
        headers.insert(
            StrBytes::from_static_str(ENCRYPTION_HEADER_NAME),
            Some(Bytes::copy_from_slice(&[self.encryption_version.code()])),
        );
        if !fields.contains(RecordFieldSet::RECORD_HEADER_VALUES) {
            for (key, value) in &record.headers {
                headers.insert(key.clone(), value.clone());
            }
        }
        headers
    }

    /// Decrypt the records of `batch`. Records without the encryption
    /// header pass through; a batch containing none is returned
    /// byte-identical. A record failing AEAD verification is dropped and
    /// counted, without poisoning its neighbours.
    pub async fn decrypt(
        &self,
        topic: &str,
        partition: i32,
        batch: Bytes,
    ) -> Result<Bytes, EncryptionError> {
        if batch.is_empty() {
            return Ok(batch);
        }
        let meta = BatchMeta::peek(&batch)?;
        if meta.magic < 2 {
            // Pre-v2 batches have no headers and so cannot be encrypted
            return Ok(batch);
        }
        let records = decode_batch(&batch)?;
        if records.is_empty() {
            return Ok(batch);
        }

        // Resolve decryptors first; concurrent fetches for the same EDEK
        // coalesce onto one KMS unwrap
        let mut states = Vec::with_capacity(records.len());
        let mut any_encrypted = false;
        for record in &records {
            let state = self.decrypt_state(topic, partition, record).await?;
            any_encrypted |= state.is_some();
            states.push(state);
        }
        if !any_encrypted {
            return Ok(batch);
        }

        let mut decrypted = 0u64;
        let mut out = Vec::with_capacity(records.len());
        for (record, state) in records.into_iter().zip(states) {
            match state {
                None => out.push(record),
                Some(state) => match self.decrypt_record(&record, &state) {
                    Ok(restored) => {
                        decrypted += 1;
                        out.push(restored);
                    }
                    Err(e) => {
                        // Scoped to this record: drop it, keep the batch
                        metrics::record_integrity_failure();
                        warn!(
                            topic,
                            partition,
                            offset = record.offset,
                            error = %e,
                            "dropping record that failed decryption"
                        );
                    }
                },
            }
        }

        metrics::record_decryptions(decrypted);
        encode_batch(&out, meta.compression)
    }

    /// Inspect one record: `None` when it is not encrypted, otherwise the
    /// resolved decryptor and wrapper geometry.
    async fn decrypt_state(
        &self,
        topic: &str,
        partition: i32,
        record: &Record,
    ) -> Result<Option<DecryptState>, EncryptionError> {
        let header_key = StrBytes::from_static_str(ENCRYPTION_HEADER_NAME);
        let Some(header_value) = record.headers.get(&header_key) else {
            return Ok(None);
        };
        let version_byte = match header_value {
            Some(value) if value.len() == 1 => value[0],
            _ => {
                return Err(EncryptionError::InvalidEncryptionHeader {
                    offset: record.offset,
                    reason: format!(
                        "header must be exactly one byte in {topic}-{partition}"
                    ),
                })
            }
        };
        let version = EncryptionVersion::from_code(version_byte)?;

        let wrapper = record.value.as_ref().ok_or_else(|| {
            EncryptionError::InvalidEncryptionHeader {
                offset: record.offset,
                reason: "encrypted record carries no value".to_string(),
            }
        })?;
        let mut pos = 0usize;
        let edek_len = get_uvarint(wrapper, &mut pos)? as usize;
        if wrapper.len() < pos + edek_len {
            return Err(EncryptionError::Truncated(
                "wrapper shorter than its EDEK length".to_string(),
            ));
        }
        let edek_bytes = wrapper.slice(pos..pos + edek_len);
        pos += edek_len;

        let decryptor = self
            .decryptor_cache
            .get_or_load(&edek_bytes, || self.make_decryptor(edek_bytes.clone()))
            .await?;

        Ok(Some(DecryptState {
            version,
            decryptor,
            wrapper: wrapper.clone(),
            payload_offset: pos,
        }))
    }

    fn make_decryptor(
        &self,
        edek_bytes: Bytes,
    ) -> impl std::future::Future<Output = Result<SharedDecryptor, EncryptionError>> + Send + 'static
    {
        let kms = self.kms.clone();
        async move {
            let edek = kms.edek_serde().deserialize(&edek_bytes)?;
            let dek = kms.decrypt_edek(&edek).await?;
            Ok(Arc::new(Mutex::new(AesGcmEncryptor::for_decrypt(&dek)?)))
        }
    }

    fn decrypt_record(
        &self,
        record: &Record,
        state: &DecryptState,
    ) -> Result<Record, EncryptionError> {
        let wrapper = &state.wrapper;
        let mut pos = state.payload_offset;

        let aad_code = *wrapper.get(pos).ok_or_else(|| {
            EncryptionError::Truncated("wrapper ends before the aad code".to_string())
        })?;
        pos += 1;
        let aad = AadSpec::from_code(aad_code)?;
        let cipher_code = *wrapper.get(pos).ok_or_else(|| {
            EncryptionError::Truncated("wrapper ends before the cipher code".to_string())
        })?;
        pos += 1;
        CipherCode::from_code(cipher_code)?;

        // The decryptor is stateful; hold its lock for the GCM duration of
        // this one record
        let plaintext = {
            let decryptor = state.decryptor.lock();
            decryptor
                .decrypt(&wrapper[pos..], aad.bytes())
                .map_err(|_| EncryptionError::IntegrityFailure {
                    offset: record.offset,
                })?
        };

        let contents = parcel::read_parcel(state.version.parcel_version(), &plaintext)?;
        let headers = match contents.headers {
            Some(headers) => headers,
            None => {
                let header_key = StrBytes::from_static_str(ENCRYPTION_HEADER_NAME);
                let mut headers = IndexMap::with_capacity(record.headers.len().saturating_sub(1));
                for (key, value) in &record.headers {
                    if *key != header_key {
                        headers.insert(key.clone(), value.clone());
                    }
                }
                headers
            }
        };

        Ok(Record {
            value: contents.value,
            headers,
            ..record.clone()
        })
    }
}

struct DecryptState {
    version: EncryptionVersion,
    decryptor: SharedDecryptor,
    /// The record's wrapper bytes, shared with the record's value
    wrapper: Bytes,
    payload_offset: usize,
}
