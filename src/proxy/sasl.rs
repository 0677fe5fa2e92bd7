//! Proxy-terminated SASL gate
//!
//! When a virtual cluster configures SASL, the frontend answers the
//! handshake and authenticate exchange itself before any frame is
//! forwarded upstream. Only the PLAIN mechanism is offered.

use bytes::Bytes;
use kafka_protocol::messages::{
    SaslAuthenticateRequest, SaslAuthenticateResponse, SaslHandshakeRequest, SaslHandshakeResponse,
};
use kafka_protocol::protocol::StrBytes;
use std::collections::HashMap;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::SaslConfig;
use crate::error::KafkaErrorCode;

const PLAIN_MECHANISM: &str = "PLAIN";

/// Gate state for one downstream connection
pub struct SaslGate {
    users: HashMap<String, String>,
    mechanism_negotiated: bool,
    principal: Option<String>,
}

impl SaslGate {
    pub fn new(config: &SaslConfig) -> Self {
        Self {
            users: config
                .users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()))
                .collect(),
            mechanism_negotiated: false,
            principal: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Answer a SaslHandshake request
    pub fn handle_handshake(&mut self, request: &SaslHandshakeRequest) -> SaslHandshakeResponse {
        let mechanisms = vec![StrBytes::from_static_str(PLAIN_MECHANISM)];
        if request.mechanism.as_str() != PLAIN_MECHANISM {
            warn!(
                mechanism = %request.mechanism.as_str(),
                "client requested unsupported SASL mechanism"
            );
            return SaslHandshakeResponse::default()
                .with_error_code(KafkaErrorCode::UnsupportedSaslMechanism.as_i16())
                .with_mechanisms(mechanisms);
        }
        self.mechanism_negotiated = true;
        SaslHandshakeResponse::default()
            .with_error_code(KafkaErrorCode::None.as_i16())
            .with_mechanisms(mechanisms)
    }

    /// Answer a SaslAuthenticate request. Returns the response and whether
    /// authentication succeeded; failure closes the connection after the
    /// response is written.
    pub fn handle_authenticate(
        &mut self,
        request: &SaslAuthenticateRequest,
    ) -> (SaslAuthenticateResponse, bool) {
        if !self.mechanism_negotiated {
            return (
                auth_failure(
                    KafkaErrorCode::IllegalSaslState,
                    "SaslAuthenticate before SaslHandshake",
                ),
                false,
            );
        }
        match self.authenticate_plain(&request.auth_bytes) {
            Ok(principal) => {
                debug!(principal = %principal, "SASL authentication succeeded");
                self.principal = Some(principal);
                (
                    SaslAuthenticateResponse::default()
                        .with_error_code(KafkaErrorCode::None.as_i16())
                        .with_auth_bytes(Bytes::new()),
                    true,
                )
            }
            Err(reason) => {
                warn!(reason, "SASL authentication failed");
                (
                    auth_failure(KafkaErrorCode::SaslAuthenticationFailed, reason),
                    false,
                )
            }
        }
    }

    /// SASL/PLAIN format: `[authzid] \0 username \0 password`.
    /// The authzid is ignored. The password copy is zeroized on drop.
    fn authenticate_plain(&self, auth_bytes: &[u8]) -> std::result::Result<String, &'static str> {
        let parts: Vec<&[u8]> = auth_bytes.split(|&b| b == 0).collect();
        if parts.len() != 3 {
            return Err("invalid SASL/PLAIN token format");
        }
        let username =
            std::str::from_utf8(parts[1]).map_err(|_| "invalid username encoding")?;
        let password: Zeroizing<String> = Zeroizing::new(
            std::str::from_utf8(parts[2])
                .map_err(|_| "invalid password encoding")?
                .to_string(),
        );
        match self.users.get(username) {
            Some(expected) if expected.as_str() == password.as_str() => Ok(username.to_string()),
            _ => Err("unknown user or wrong password"),
        }
    }
}

fn auth_failure(code: KafkaErrorCode, message: &str) -> SaslAuthenticateResponse {
    SaslAuthenticateResponse::default()
        .with_error_code(code.as_i16())
        .with_error_message(Some(StrBytes::from_string(message.to_string())))
        .with_auth_bytes(Bytes::new())
}
