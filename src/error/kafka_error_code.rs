//! Kafka protocol error codes used by the proxy
//!
//! Only the codes the proxy itself can originate are listed; everything else
//! flows through from the upstream broker untouched.
//! See: <https://kafka.apache.org/protocol.html#protocol_error_codes>

/// Kafka protocol error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum KafkaErrorCode {
    /// Unknown server error
    UnknownServerError = -1,
    /// No error
    None = 0,
    /// Message failed its CRC check or is otherwise corrupt
    CorruptMessage = 2,
    /// Request timed out
    RequestTimedOut = 7,
    /// Broker not available
    BrokerNotAvailable = 8,
    /// Network exception while relaying
    NetworkException = 13,
    /// Unsupported SASL mechanism
    UnsupportedSaslMechanism = 33,
    /// Illegal SASL state
    IllegalSaslState = 34,
    /// Unsupported API version
    UnsupportedVersion = 35,
    /// Request parameters do not satisfy configured policy
    PolicyViolation = 44,
    /// SASL authentication failed
    SaslAuthenticationFailed = 58,
    /// The record failed broker-side validation
    InvalidRecord = 87,
}

impl KafkaErrorCode {
    /// The wire representation of this error code
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}
