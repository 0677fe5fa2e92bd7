//! API version tables for the Kafka protocol
//!
//! Header versions follow the flexible-versions rules: request headers move
//! from v1 to v2 and response headers from v0 to v1 at the API version where
//! the message schema became flexible. ApiVersions responses always use
//! header v0 so that clients can parse the error before they know which
//! versions the peer speaks.

use kafka_protocol::messages::ApiKey;

/// Versions of each API the proxy itself understands, used when an
/// ApiVersions request is answered without an upstream round trip and when
/// intersecting upstream ApiVersions responses.
///
/// Format: (api_key, min_version, max_version)
#[rustfmt::skip]
pub const SUPPORTED_API_VERSIONS: &[(i16, i16, i16)] = &[
    // Core protocol
    (0,  0, 9),   // Produce
    (1,  0, 15),  // Fetch
    (2,  0, 7),   // ListOffsets
    (3,  0, 12),  // Metadata
    (18, 0, 3),   // ApiVersions

    // Topic management
    (19, 0, 7),   // CreateTopics
    (20, 0, 6),   // DeleteTopics
    (37, 0, 3),   // CreatePartitions
    (32, 0, 4),   // DescribeConfigs
    (33, 0, 2),   // AlterConfigs
    (44, 0, 1),   // IncrementalAlterConfigs

    // Consumer groups
    (8,  0, 8),   // OffsetCommit
    (9,  0, 8),   // OffsetFetch
    (10, 0, 4),   // FindCoordinator
    (11, 0, 9),   // JoinGroup
    (12, 0, 4),   // Heartbeat
    (13, 0, 5),   // LeaveGroup
    (14, 0, 5),   // SyncGroup
    (15, 0, 5),   // DescribeGroups
    (16, 0, 4),   // ListGroups
    (42, 0, 2),   // DeleteGroups
    (47, 0, 0),   // OffsetDelete

    // Authentication
    (17, 0, 1),   // SaslHandshake
    (36, 0, 2),   // SaslAuthenticate

    // Transactions
    (22, 0, 4),   // InitProducerId
    (24, 0, 4),   // AddPartitionsToTxn
    (25, 0, 3),   // AddOffsetsToTxn
    (26, 0, 3),   // EndTxn
    (28, 0, 3),   // TxnOffsetCommit

    // Cluster metadata
    (21, 0, 2),   // DeleteRecords
    (23, 0, 4),   // OffsetForLeaderEpoch
    (29, 0, 3),   // DescribeAcls
    (30, 0, 3),   // CreateAcls
    (31, 0, 3),   // DeleteAcls
    (43, 0, 2),   // ElectLeaders
    (45, 0, 0),   // AlterPartitionReassignments
    (46, 0, 0),   // ListPartitionReassignments
    (60, 0, 1),   // DescribeCluster
    (61, 0, 0),   // DescribeProducers
    (65, 0, 0),   // DescribeTransactions
    (66, 0, 0),   // ListTransactions
];

/// First flexible version per decodable API: (api_key, request flexible
/// start, response flexible start). `None` means the API never became
/// flexible within the versions we decode.
#[rustfmt::skip]
const FLEXIBLE_VERSIONS: &[(i16, Option<i16>, Option<i16>)] = &[
    (0,  Some(9),  Some(9)),    // Produce
    (1,  Some(12), Some(12)),   // Fetch
    (2,  Some(6),  Some(6)),    // ListOffsets
    (3,  Some(9),  Some(9)),    // Metadata
    (10, Some(3),  Some(3)),    // FindCoordinator
    (17, None,     None),       // SaslHandshake
    (18, Some(3),  None),       // ApiVersions (response header always v0)
    (36, Some(2),  Some(2)),    // SaslAuthenticate
];

fn flexible_entry(api_key: i16) -> Option<&'static (i16, Option<i16>, Option<i16>)> {
    FLEXIBLE_VERSIONS.iter().find(|(key, _, _)| *key == api_key)
}

/// Header version for a request of the given API
pub fn request_header_version(api_key: i16, api_version: i16) -> i16 {
    match flexible_entry(api_key) {
        Some((_, Some(start), _)) if api_version >= *start => 2,
        _ => 1,
    }
}

/// Header version for a response of the given API
pub fn response_header_version(api_key: i16, api_version: i16) -> i16 {
    if api_key == ApiKey::ApiVersionsKey as i16 {
        return 0;
    }
    match flexible_entry(api_key) {
        Some((_, _, Some(start))) if api_version >= *start => 1,
        _ => 0,
    }
}

/// The version range the proxy supports for an API, if any
pub fn supported_version_range(api_key: i16) -> Option<(i16, i16)> {
    SUPPORTED_API_VERSIONS
        .iter()
        .find(|(key, _, _)| *key == api_key)
        .map(|(_, min, max)| (*min, *max))
}

/// Human-readable API name for logs and metric labels
pub fn api_key_name(api_key: i16) -> &'static str {
    match ApiKey::try_from(api_key) {
        Ok(ApiKey::ProduceKey) => "produce",
        Ok(ApiKey::FetchKey) => "fetch",
        Ok(ApiKey::ListOffsetsKey) => "list_offsets",
        Ok(ApiKey::MetadataKey) => "metadata",
        Ok(ApiKey::OffsetCommitKey) => "offset_commit",
        Ok(ApiKey::OffsetFetchKey) => "offset_fetch",
        Ok(ApiKey::FindCoordinatorKey) => "find_coordinator",
        Ok(ApiKey::JoinGroupKey) => "join_group",
        Ok(ApiKey::HeartbeatKey) => "heartbeat",
        Ok(ApiKey::LeaveGroupKey) => "leave_group",
        Ok(ApiKey::SyncGroupKey) => "sync_group",
        Ok(ApiKey::SaslHandshakeKey) => "sasl_handshake",
        Ok(ApiKey::ApiVersionsKey) => "api_versions",
        Ok(ApiKey::CreateTopicsKey) => "create_topics",
        Ok(ApiKey::DeleteTopicsKey) => "delete_topics",
        Ok(ApiKey::InitProducerIdKey) => "init_producer_id",
        Ok(ApiKey::SaslAuthenticateKey) => "sasl_authenticate",
        Ok(_) => "other",
        Err(_) => "unknown",
    }
}
