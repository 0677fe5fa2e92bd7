//! Metrics collection and exposition for Streamgate
//!
//! This module provides Prometheus-compatible metrics for monitoring the
//! proxy data path and the envelope-encryption filter.
//!
//! When the `metrics` feature is disabled, all functions become no-ops,
//! allowing the code to compile without the metrics dependencies while
//! maintaining the same API surface.

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
#[cfg(feature = "metrics")]
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[cfg(feature = "metrics")]
static METRICS_INITIALIZED: OnceLock<Arc<PrometheusHandle>> = OnceLock::new();

/// Initialize metrics and return the Prometheus handle.
///
/// This function can only be called once per process due to the global
/// nature of the metrics recorder. In tests, the first call wins.
#[cfg(feature = "metrics")]
pub fn init_metrics() -> PrometheusHandle {
    if let Some(handle) = METRICS_INITIALIZED.get() {
        return (**handle).clone();
    }

    let builder = PrometheusBuilder::new();
    match builder.install_recorder() {
        Ok(handle) => {
            register_metrics();
            let _ = METRICS_INITIALIZED.set(Arc::new(handle.clone()));
            handle
        }
        Err(_) => {
            // Already installed elsewhere; return the stored handle if we
            // have one, otherwise a detached handle for rendering only.
            if let Some(handle) = METRICS_INITIALIZED.get() {
                return (**handle).clone();
            }
            let recorder = PrometheusBuilder::new().build_recorder();
            recorder.handle()
        }
    }
}

/// Register all metrics with their descriptions
#[cfg(feature = "metrics")]
fn register_metrics() {
    describe_gauge!(
        "streamgate_connections_active",
        "Number of currently active downstream connections"
    );
    describe_counter!(
        "streamgate_connections_total",
        "Total number of downstream connections accepted"
    );
    describe_counter!(
        "streamgate_frames_total",
        "Frames relayed, labelled by direction and decode path"
    );
    describe_histogram!(
        "streamgate_request_duration_seconds",
        "Time from request arrival to response submission"
    );
    describe_counter!(
        "streamgate_short_circuit_responses_total",
        "Responses generated by filters without an upstream round trip"
    );
    describe_counter!(
        "streamgate_upstream_connects_total",
        "Upstream TCP connections established"
    );
    describe_counter!(
        "streamgate_record_encryptions_total",
        "Records encrypted by the envelope encryption filter"
    );
    describe_counter!(
        "streamgate_record_decryptions_total",
        "Records decrypted by the envelope encryption filter"
    );
    describe_counter!(
        "streamgate_dek_rotations_total",
        "DEKs destroyed and replaced after exhaustion or expiry"
    );
    describe_counter!(
        "streamgate_kms_generate_dek_total",
        "generateDekPair calls issued to the KMS"
    );
    describe_counter!(
        "streamgate_decrypt_integrity_failures_total",
        "Records dropped because AEAD tag verification failed"
    );
    describe_counter!(
        "streamgate_buffer_pool_hits_total",
        "Buffer pool acquisitions served from the pool"
    );
    describe_counter!(
        "streamgate_buffer_pool_misses_total",
        "Buffer pool acquisitions that fell back to allocation"
    );
}

/// Record a change in the number of active connections
pub fn record_connection_active(delta: i64) {
    #[cfg(feature = "metrics")]
    {
        gauge!("streamgate_connections_active").increment(delta as f64);
        if delta > 0 {
            counter!("streamgate_connections_total").increment(delta as u64);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = delta;
}

/// Record a relayed frame
pub fn record_frame(direction: &'static str, decoded: bool) {
    #[cfg(feature = "metrics")]
    counter!(
        "streamgate_frames_total",
        "direction" => direction,
        "path" => if decoded { "decoded" } else { "opaque" }
    )
    .increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, decoded);
}

/// Record the latency of one request/response exchange
pub fn record_request_duration(api_key_name: &'static str, duration: Duration) {
    #[cfg(feature = "metrics")]
    histogram!("streamgate_request_duration_seconds", "api" => api_key_name)
        .record(duration.as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = (api_key_name, duration);
}

/// Record a filter-generated response
pub fn record_short_circuit() {
    #[cfg(feature = "metrics")]
    counter!("streamgate_short_circuit_responses_total").increment(1);
}

/// Record an upstream connection being established
pub fn record_upstream_connect() {
    #[cfg(feature = "metrics")]
    counter!("streamgate_upstream_connects_total").increment(1);
}

/// Record records encrypted in one batch
pub fn record_encryptions(count: u64) {
    #[cfg(feature = "metrics")]
    counter!("streamgate_record_encryptions_total").increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record records decrypted in one batch
pub fn record_decryptions(count: u64) {
    #[cfg(feature = "metrics")]
    counter!("streamgate_record_decryptions_total").increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record a DEK being destroyed and replaced
pub fn record_dek_rotation() {
    #[cfg(feature = "metrics")]
    counter!("streamgate_dek_rotations_total").increment(1);
}

/// Record a generateDekPair call to the KMS
pub fn record_kms_generate_dek() {
    #[cfg(feature = "metrics")]
    counter!("streamgate_kms_generate_dek_total").increment(1);
}

/// Record a record dropped due to AEAD verification failure
pub fn record_integrity_failure() {
    #[cfg(feature = "metrics")]
    counter!("streamgate_decrypt_integrity_failures_total").increment(1);
}

/// Record a buffer pool acquisition outcome
pub fn record_buffer_pool(hit: bool) {
    #[cfg(feature = "metrics")]
    {
        if hit {
            counter!("streamgate_buffer_pool_hits_total").increment(1);
        } else {
            counter!("streamgate_buffer_pool_misses_total").increment(1);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = hit;
}
