//! Envelope record encryption filter
//!
//! Intercepts Produce requests and Fetch responses. Produced record values
//! (and optionally header values) are encrypted under a per-KEK DEK leased
//! from the KMS; fetched records carrying the encryption header are
//! restored. Topics resolve to KEKs through a name template; topics whose
//! template resolves to no KEK pass through or fail depending on policy.

mod batch;
mod buffer_pool;
mod cache;
mod cipher;
mod key_context;
mod key_manager;
mod parcel;
mod scheme;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use cache::LoadingCache;
pub use cipher::{AesGcmEncryptor, AesGcmIvGenerator, IV_SIZE, TAG_SIZE};
pub use key_context::KeyContext;
pub use key_manager::{
    InBandKeyManager, DEFAULT_DEK_TTL, DEFAULT_MAX_ENCRYPTIONS_PER_DEK, ENCRYPTION_HEADER_NAME,
};
pub use scheme::{
    AadSpec, CipherCode, EncryptionScheme, EncryptionVersion, ParcelVersion, RecordFieldSet,
    WrapperVersion,
};

use async_trait::async_trait;
use kafka_protocol::messages::produce_response::{
    PartitionProduceResponse, TopicProduceResponse,
};
use kafka_protocol::messages::{ApiKey, ProduceRequest, ProduceResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec::{DecodedRequest, DecodedResponse, RequestFrame, ResponseFrame};
use crate::error::{EncryptionError, GateError, KafkaErrorCode, KmsError, Result};
use crate::filter::{
    FilterContext, FilterDecl, FilterFactory, FilterInstanceFactory, FilterOutcome, RequestFilter,
    ResponseFilter, ResponseOutcome, SpecificBinding,
};
use crate::kms::{InMemoryKms, Kms};

/// Configuration surface of the `recordEncryption` filter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordEncryptionConfig {
    /// KEK alias template; `${topicName}` is substituted per topic
    pub kek_template: String,

    /// Which record fields to encrypt: `value`, optionally `headerValues`
    pub record_fields: Vec<String>,

    /// Encryption budget of one DEK
    pub max_encryptions_per_dek: u64,

    /// DEK lifetime in milliseconds
    pub dek_ttl_ms: u64,

    /// What to do when a topic's template resolves to no KEK
    pub unresolved_key_policy: UnresolvedKeyPolicy,

    /// KMS provider
    pub kms: KmsProviderConfig,
}

impl Default for RecordEncryptionConfig {
    fn default() -> Self {
        Self {
            kek_template: "${topicName}".to_string(),
            record_fields: vec!["value".to_string()],
            max_encryptions_per_dek: DEFAULT_MAX_ENCRYPTIONS_PER_DEK,
            dek_ttl_ms: DEFAULT_DEK_TTL.as_millis() as u64,
            unresolved_key_policy: UnresolvedKeyPolicy::Passthrough,
            kms: KmsProviderConfig::InMemory { keks: Vec::new() },
        }
    }
}

/// Behaviour for topics without a resolvable KEK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedKeyPolicy {
    /// Relay the topic's records unencrypted
    Passthrough,
    /// Fail the produce request
    Reject,
}

/// KMS provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum KmsProviderConfig {
    /// In-process KMS for development and tests
    InMemory { keks: Vec<String> },
}

/// Maps a topic name to the KEK alias to resolve
pub struct TemplateKekSelector {
    template: String,
}

impl TemplateKekSelector {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn alias_for(&self, topic: &str) -> String {
        self.template.replace("${topicName}", topic)
    }
}

/// The envelope encryption filter. Cheap to clone: connection instances
/// share the key manager, its caches and the KEK resolution cache.
pub struct RecordEncryptionFilter<M: Kms> {
    kms: Arc<M>,
    key_manager: Arc<InBandKeyManager<M>>,
    selector: Arc<TemplateKekSelector>,
    kek_cache: Arc<LoadingCache<String, M::KekId, KmsError>>,
    record_fields: RecordFieldSet,
    unresolved_key_policy: UnresolvedKeyPolicy,
}

impl<M: Kms> Clone for RecordEncryptionFilter<M> {
    fn clone(&self) -> Self {
        Self {
            kms: self.kms.clone(),
            key_manager: self.key_manager.clone(),
            selector: self.selector.clone(),
            kek_cache: self.kek_cache.clone(),
            record_fields: self.record_fields,
            unresolved_key_policy: self.unresolved_key_policy,
        }
    }
}

impl<M: Kms> RecordEncryptionFilter<M> {
    pub fn new(
        kms: Arc<M>,
        key_manager: Arc<InBandKeyManager<M>>,
        selector: TemplateKekSelector,
        record_fields: RecordFieldSet,
        unresolved_key_policy: UnresolvedKeyPolicy,
    ) -> Self {
        Self {
            kms,
            key_manager,
            selector: Arc::new(selector),
            kek_cache: Arc::new(LoadingCache::new()),
            record_fields,
            unresolved_key_policy,
        }
    }

    /// The declaration installing this filter into a chain
    pub fn decl(&self) -> FilterDecl {
        FilterDecl::specific(
            "recordEncryption",
            vec![SpecificBinding {
                request_keys: vec![ApiKey::ProduceKey],
                response_keys: vec![ApiKey::FetchKey],
                request: Some(Box::new(self.clone())),
                response: Some(Box::new(self.clone())),
            }],
        )
    }

    /// Resolve the KEK for a topic, honouring the unresolved-key policy.
    async fn resolve_kek(&self, topic: &str) -> std::result::Result<Option<M::KekId>, EncryptionError> {
        let alias = self.selector.alias_for(topic);
        let kms = self.kms.clone();
        let load_alias = alias.clone();
        let resolved = self
            .kek_cache
            .get_or_load(&alias, move || async move {
                kms.resolve_kek_id(&load_alias).await
            })
            .await;
        match resolved {
            Ok(kek_id) => Ok(Some(kek_id)),
            Err(KmsError::UnknownAlias(_)) => match self.unresolved_key_policy {
                UnresolvedKeyPolicy::Passthrough => {
                    debug!(topic, alias, "no KEK for topic, passing records through");
                    Ok(None)
                }
                UnresolvedKeyPolicy::Reject => Err(EncryptionError::Kms(format!(
                    "no KEK for topic {topic} (alias {alias})"
                ))),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Encrypt every partition of the request in place. On failure returns
    /// the error to answer the whole produce request with.
    async fn encrypt_produce(
        &self,
        request: &mut ProduceRequest,
    ) -> std::result::Result<(), EncryptionError> {
        for topic_data in request.topic_data.iter_mut() {
            let topic = topic_data.name.as_str().to_string();
            let Some(kek_id) = self.resolve_kek(&topic).await? else {
                continue;
            };
            let scheme = EncryptionScheme::new(kek_id, self.record_fields);
            for partition in topic_data.partition_data.iter_mut() {
                if let Some(records) = partition.records.take() {
                    let encrypted = self
                        .key_manager
                        .encrypt(&topic, partition.index, &scheme, records)
                        .await?;
                    partition.records = Some(encrypted);
                }
            }
        }
        Ok(())
    }

    async fn decrypt_fetch(&self, response: &mut kafka_protocol::messages::FetchResponse) {
        for topic in response.responses.iter_mut() {
            let topic_name = topic.topic.as_str().to_string();
            for partition in topic.partitions.iter_mut() {
                if let Some(records) = partition.records.take() {
                    match self
                        .key_manager
                        .decrypt(&topic_name, partition.partition_index, records)
                        .await
                    {
                        Ok(decrypted) => partition.records = Some(decrypted),
                        Err(e) => {
                            // Partition-scoped failure: the client sees a
                            // corrupt-message error rather than ciphertext
                            warn!(
                                topic = %topic_name,
                                partition = partition.partition_index,
                                error = %e,
                                "failed to decrypt fetched partition"
                            );
                            partition.error_code = KafkaErrorCode::CorruptMessage.as_i16();
                            partition.records = None;
                        }
                    }
                }
            }
        }
    }
}

/// Build the produce response failing every partition of the request
fn produce_error_response(request: &ProduceRequest, error_code: i16) -> ProduceResponse {
    let responses = request
        .topic_data
        .iter()
        .map(|topic_data| {
            let partitions = topic_data
                .partition_data
                .iter()
                .map(|partition| {
                    PartitionProduceResponse::default()
                        .with_index(partition.index)
                        .with_error_code(error_code)
                        .with_base_offset(-1)
                        .with_log_append_time_ms(-1)
                        .with_log_start_offset(-1)
                })
                .collect();
            TopicProduceResponse::default()
                .with_name(topic_data.name.clone())
                .with_partition_responses(partitions)
        })
        .collect();
    ProduceResponse::default()
        .with_responses(responses)
        .with_throttle_time_ms(0)
}

#[async_trait]
impl<M: Kms> RequestFilter for RecordEncryptionFilter<M> {
    async fn on_request(
        &mut self,
        _ctx: &FilterContext,
        mut frame: RequestFrame,
    ) -> Result<FilterOutcome> {
        let Some(DecodedRequest::Produce(request)) = frame.decoded_mut() else {
            return Ok(FilterOutcome::Forward(frame));
        };

        // acks=0 produce requests get no response; an encryption failure
        // there can only drop the request
        let fire_and_forget = request.acks == 0;

        match self.encrypt_produce(request).await {
            Ok(()) => Ok(FilterOutcome::Forward(frame)),
            Err(e) => {
                warn!(error = %e, "produce request failed encryption");
                let error_code = e.kafka_error_code().as_i16();
                if fire_and_forget {
                    return Ok(FilterOutcome::Drop {
                        close_connection: false,
                    });
                }
                let Some(DecodedRequest::Produce(request)) = frame.decoded() else {
                    unreachable!("payload checked above");
                };
                let response = ResponseFrame::decoded(
                    frame.api_key,
                    frame.api_version,
                    frame.correlation_id(),
                    DecodedResponse::Produce(produce_error_response(request, error_code)),
                );
                Ok(FilterOutcome::ShortCircuit(response))
            }
        }
    }
}

#[async_trait]
impl<M: Kms> ResponseFilter for RecordEncryptionFilter<M> {
    async fn on_response(
        &mut self,
        _ctx: &FilterContext,
        mut frame: ResponseFrame,
    ) -> Result<ResponseOutcome> {
        if let Some(DecodedResponse::Fetch(response)) = frame.decoded_mut() {
            self.decrypt_fetch(response).await;
        }
        Ok(ResponseOutcome::Forward(frame))
    }
}

/// Registry factory for the `recordEncryption` filter
pub struct RecordEncryptionFilterFactory;

impl FilterFactory for RecordEncryptionFilterFactory {
    fn short_name(&self) -> &'static str {
        "recordEncryption"
    }

    fn initialize(&self, config: &toml::Value) -> Result<Arc<dyn FilterInstanceFactory>> {
        let config: RecordEncryptionConfig = config.clone().try_into().map_err(|e| {
            GateError::Config(format!("invalid recordEncryption configuration: {e}"))
        })?;

        let mut record_fields = RecordFieldSet::empty();
        for field in &config.record_fields {
            match field.as_str() {
                "value" => record_fields = record_fields.with(RecordFieldSet::RECORD_VALUE),
                "headerValues" => {
                    record_fields = record_fields.with(RecordFieldSet::RECORD_HEADER_VALUES)
                }
                other => {
                    return Err(GateError::Config(format!(
                        "unknown record field '{other}' (expected 'value' or 'headerValues')"
                    )))
                }
            }
        }
        if !record_fields.contains(RecordFieldSet::RECORD_VALUE) {
            return Err(GateError::Config(
                "recordEncryption must encrypt the record value; header-only \
                 schemes cannot restore the original value on fetch"
                    .to_string(),
            ));
        }

        let KmsProviderConfig::InMemory { keks } = &config.kms;
        let kms = Arc::new(InMemoryKms::new());
        for kek in keks {
            kms.create_kek(kek.clone());
        }

        let key_manager = Arc::new(InBandKeyManager::with_limits(
            kms.clone(),
            Arc::new(BufferPool::new()),
            config.max_encryptions_per_dek,
            Duration::from_millis(config.dek_ttl_ms),
        ));
        let filter = RecordEncryptionFilter::new(
            kms,
            key_manager,
            TemplateKekSelector::new(config.kek_template.clone()),
            record_fields,
            config.unresolved_key_policy,
        );
        Ok(Arc::new(RecordEncryptionInstanceFactory { filter }))
    }
}

struct RecordEncryptionInstanceFactory {
    filter: RecordEncryptionFilter<InMemoryKms>,
}

impl FilterInstanceFactory for RecordEncryptionInstanceFactory {
    fn create(&self) -> FilterDecl {
        self.filter.decl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_selector_substitution() {
        let selector = TemplateKekSelector::new("KEK_${topicName}");
        assert_eq!(selector.alias_for("orders"), "KEK_orders");
        let fixed = TemplateKekSelector::new("shared-kek");
        assert_eq!(fixed.alias_for("orders"), "shared-kek");
    }

    #[test]
    fn test_factory_rejects_header_only_fields() {
        let raw = r#"
record_fields = ["headerValues"]
[kms]
provider = "in_memory"
keks = []
"#;
        let value: toml::Value = toml::from_str(raw).unwrap();
        assert!(RecordEncryptionFilterFactory.initialize(&value).is_err());
    }

    #[test]
    fn test_factory_rejects_unknown_field() {
        let raw = r#"
record_fields = ["value", "key"]
[kms]
provider = "in_memory"
keks = []
"#;
        let value: toml::Value = toml::from_str(raw).unwrap();
        assert!(RecordEncryptionFilterFactory.initialize(&value).is_err());
    }

    #[test]
    fn test_factory_builds_from_defaults() {
        let value: toml::Value = toml::from_str("").unwrap();
        let factory = RecordEncryptionFilterFactory.initialize(&value).unwrap();
        let decl = factory.create();
        assert_eq!(decl.name, "recordEncryption");
        assert_eq!(decl.specific.len(), 1);
    }

    #[test]
    fn test_produce_error_response_mirrors_request_topology() {
        use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
        use kafka_protocol::messages::TopicName;
        use kafka_protocol::protocol::StrBytes;

        let request = ProduceRequest::default().with_topic_data(vec![TopicProduceData::default()
            .with_name(TopicName(StrBytes::from_static_str("orders")))
            .with_partition_data(vec![
                PartitionProduceData::default().with_index(0),
                PartitionProduceData::default().with_index(3),
            ])]);
        let response =
            produce_error_response(&request, KafkaErrorCode::PolicyViolation.as_i16());
        assert_eq!(response.responses.len(), 1);
        let topic = &response.responses[0];
        assert_eq!(topic.partition_responses.len(), 2);
        assert_eq!(topic.partition_responses[0].index, 0);
        assert_eq!(topic.partition_responses[1].index, 3);
        assert!(topic
            .partition_responses
            .iter()
            .all(|p| p.error_code == KafkaErrorCode::PolicyViolation.as_i16()));
    }
}
