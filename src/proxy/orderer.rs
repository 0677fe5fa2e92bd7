//! Response ordering for pipelined connections
//!
//! Kafka requires responses to be written in the order the matching
//! requests arrived, even when filters complete responses out of order
//! (a short-circuited ApiVersions response is ready immediately while an
//! earlier produce is still waiting on the upstream). The orderer assigns
//! a sequence number per arriving request and buffers completed responses
//! until every earlier sequence has been emitted.
//!
//! Sequence numbers, not correlation ids, drive the ordering: correlation
//! ids are client-chosen and need not be sequential.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::error::{GateError, Result};

/// A completed response ready to be written downstream
#[derive(Debug)]
pub struct PendingResponse {
    /// The downstream correlation id, for logging only; the bytes already
    /// carry it
    pub correlation_id: i32,
    /// The serialized response frame, without the length prefix
    pub data: Bytes,
}

/// A buffered slot: either a response or a tombstone for a dropped request
type Slot = Option<PendingResponse>;

/// Orders completed responses by request arrival and bounds the number of
/// requests in flight.
///
/// A `BTreeMap` keyed by sequence holds out-of-order completions; for the
/// small windows involved (max_in_flight is typically 10) it beats a hash
/// map on locality and gives in-order draining for free.
pub struct ResponseOrderer {
    in_flight_semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    response_tx: mpsc::Sender<PendingResponse>,
    buffer: Mutex<BTreeMap<u64, Slot>>,
    next_send_seq: Mutex<u64>,
    next_request_seq: AtomicU64,
}

impl ResponseOrderer {
    pub fn new(max_in_flight: usize) -> (Self, mpsc::Receiver<PendingResponse>) {
        let (response_tx, response_rx) = mpsc::channel(max_in_flight.max(1) * 2);
        let orderer = Self {
            in_flight_semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            response_tx,
            buffer: Mutex::new(BTreeMap::new()),
            next_send_seq: Mutex::new(0),
            next_request_seq: AtomicU64::new(0),
        };
        (orderer, response_rx)
    }

    /// Acquire a slot for a newly arrived request. Waits when the in-flight
    /// window is full, which is what pauses the downstream read loop under
    /// back-pressure. Returns the sequence number the response must be
    /// submitted with.
    pub async fn acquire(&self) -> Result<(InFlightPermit, u64)> {
        let permit = self
            .in_flight_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::ShuttingDown)?;
        let seq = self.next_request_seq.fetch_add(1, Ordering::Relaxed);
        Ok((InFlightPermit { _permit: permit }, seq))
    }

    /// Submit the completed response for a sequence number.
    pub async fn submit(&self, seq: u64, response: PendingResponse) {
        self.submit_slot(seq, Some(response)).await;
    }

    /// Mark a sequence number as never producing a response (the request
    /// was dropped by a filter), so later responses are not held up.
    pub async fn submit_skip(&self, seq: u64) {
        self.submit_slot(seq, None).await;
    }

    async fn submit_slot(&self, seq: u64, slot: Slot) {
        // Collect everything now in order while holding the locks, then
        // send after releasing them so a slow writer cannot extend the
        // critical section.
        let ready = {
            let mut buffer = self.buffer.lock().await;
            let mut next_send = self.next_send_seq.lock().await;
            let mut ready = Vec::new();

            if seq == *next_send {
                if let Some(response) = slot {
                    ready.push(response);
                }
                *next_send += 1;
                while let Some(buffered) = buffer.remove(&*next_send) {
                    if let Some(response) = buffered {
                        ready.push(response);
                    }
                    *next_send += 1;
                }
            } else {
                buffer.insert(seq, slot);
            }

            ready
        };

        for response in ready {
            // The writer side hanging up means the connection is closing;
            // remaining responses are discarded with it.
            if self.response_tx.send(response).await.is_err() {
                break;
            }
        }
    }

    /// Number of requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.in_flight_semaphore.available_permits()
    }
}

/// RAII guard for one in-flight request slot
pub struct InFlightPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(correlation_id: i32) -> PendingResponse {
        PendingResponse {
            correlation_id,
            data: Bytes::from(vec![correlation_id as u8]),
        }
    }

    #[tokio::test]
    async fn test_in_order_submission_passes_through() {
        let (orderer, mut rx) = ResponseOrderer::new(10);
        orderer.submit(0, response(5)).await;
        orderer.submit(1, response(6)).await;
        assert_eq!(rx.recv().await.unwrap().correlation_id, 5);
        assert_eq!(rx.recv().await.unwrap().correlation_id, 6);
    }

    #[tokio::test]
    async fn test_out_of_order_completion_is_reordered() {
        let (orderer, mut rx) = ResponseOrderer::new(10);

        // Responses complete in order r3, r1, r2; bytes must emerge r1, r2, r3
        orderer.submit(2, response(300)).await;
        orderer.submit(0, response(100)).await;
        orderer.submit(1, response(200)).await;

        assert_eq!(rx.recv().await.unwrap().correlation_id, 100);
        assert_eq!(rx.recv().await.unwrap().correlation_id, 200);
        assert_eq!(rx.recv().await.unwrap().correlation_id, 300);
    }

    #[tokio::test]
    async fn test_correlation_ids_need_not_be_sequential() {
        let (orderer, mut rx) = ResponseOrderer::new(10);
        orderer.submit(1, response(50)).await;
        orderer.submit(0, response(100)).await;
        assert_eq!(rx.recv().await.unwrap().correlation_id, 100);
        assert_eq!(rx.recv().await.unwrap().correlation_id, 50);
    }

    #[tokio::test]
    async fn test_skipped_slot_does_not_stall() {
        let (orderer, mut rx) = ResponseOrderer::new(10);
        orderer.submit(2, response(3)).await;
        orderer.submit_skip(1).await;
        orderer.submit(0, response(1)).await;
        assert_eq!(rx.recv().await.unwrap().correlation_id, 1);
        assert_eq!(rx.recv().await.unwrap().correlation_id, 3);
    }

    #[tokio::test]
    async fn test_acquire_assigns_sequences_and_bounds_in_flight() {
        let (orderer, _rx) = ResponseOrderer::new(2);
        let (permit1, seq1) = orderer.acquire().await.unwrap();
        let (_permit2, seq2) = orderer.acquire().await.unwrap();
        assert_eq!(seq1, 0);
        assert_eq!(seq2, 1);
        assert_eq!(orderer.in_flight(), 2);

        // Window full: a third acquire must wait until a permit frees
        let waiter = tokio::time::timeout(std::time::Duration::from_millis(50), orderer.acquire());
        assert!(waiter.await.is_err());

        drop(permit1);
        let (_permit3, seq3) = orderer.acquire().await.unwrap();
        assert_eq!(seq3, 2);
    }
}
