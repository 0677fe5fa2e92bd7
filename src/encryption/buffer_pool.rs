//! Size-classed pool of reusable byte buffers
//!
//! The record transform borrows two buffers per batch (parcel and
//! wrapper), sized to the batch's worst case. Classes are powers of two;
//! acquisition returns a buffer of at least the requested size. The pool
//! is bounded per class; when a class is exhausted, or the request exceeds
//! the largest class, the fallback allocation is handed out unpooled and
//! simply dropped on release. Release happens on guard drop, so a buffer
//! cannot be released twice.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

use crate::metrics;

/// Smallest pooled buffer size
const MIN_CLASS_SIZE: usize = 4 * 1024;

/// Largest pooled buffer size
const MAX_CLASS_SIZE: usize = 1024 * 1024;

/// Buffers retained per size class
const DEFAULT_CLASS_CAPACITY: usize = 16;

struct SizeClass {
    size: usize,
    buffers: Mutex<Vec<BytesMut>>,
    capacity: usize,
}

/// A bounded pool of reusable buffers indexed by size class
pub struct BufferPool {
    classes: Vec<SizeClass>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_class_capacity(DEFAULT_CLASS_CAPACITY)
    }

    pub fn with_class_capacity(capacity: usize) -> Self {
        let mut classes = Vec::new();
        let mut size = MIN_CLASS_SIZE;
        while size <= MAX_CLASS_SIZE {
            classes.push(SizeClass {
                size,
                buffers: Mutex::new(Vec::new()),
                capacity,
            });
            size *= 2;
        }
        Self { classes }
    }

    /// Borrow a buffer with capacity of at least `min_size`. The buffer is
    /// returned to the pool when the guard drops.
    pub fn acquire(&self, min_size: usize) -> PooledBuffer<'_> {
        match self.classes.iter().position(|c| c.size >= min_size) {
            Some(index) => {
                let class = &self.classes[index];
                let buffer = class.buffers.lock().pop();
                match buffer {
                    Some(mut buffer) => {
                        buffer.clear();
                        metrics::record_buffer_pool(true);
                        PooledBuffer {
                            pool: self,
                            class: Some(index),
                            buffer,
                        }
                    }
                    None => {
                        metrics::record_buffer_pool(false);
                        PooledBuffer {
                            pool: self,
                            class: Some(index),
                            buffer: BytesMut::with_capacity(class.size),
                        }
                    }
                }
            }
            // Larger than any class: unpooled, dropped on release
            None => {
                metrics::record_buffer_pool(false);
                PooledBuffer {
                    pool: self,
                    class: None,
                    buffer: BytesMut::with_capacity(min_size),
                }
            }
        }
    }

    fn release(&self, class: usize, buffer: BytesMut) {
        let class = &self.classes[class];
        if buffer.capacity() < class.size {
            // Split-off buffers that lost capacity are not worth pooling
            return;
        }
        let mut buffers = class.buffers.lock();
        if buffers.len() < class.capacity {
            buffers.push(buffer);
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.classes.iter().map(|c| c.buffers.lock().len()).sum()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a borrowed buffer
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    class: Option<usize>,
    buffer: BytesMut,
}

impl Deref for PooledBuffer<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            self.pool.release(class, std::mem::take(&mut self.buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_at_least_requested_size() {
        let pool = BufferPool::new();
        let buffer = pool.acquire(10_000);
        assert!(buffer.capacity() >= 10_000);
    }

    #[test]
    fn test_release_returns_buffer_for_reuse() {
        let pool = BufferPool::with_class_capacity(4);
        {
            let mut buffer = pool.acquire(MIN_CLASS_SIZE);
            buffer.extend_from_slice(b"dirty");
        }
        assert_eq!(pool.pooled_count(), 1);
        let buffer = pool.acquire(MIN_CLASS_SIZE);
        assert!(buffer.is_empty());
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::with_class_capacity(2);
        let a = pool.acquire(MIN_CLASS_SIZE);
        let b = pool.acquire(MIN_CLASS_SIZE);
        let c = pool.acquire(MIN_CLASS_SIZE);
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.pooled_count(), 2);
    }

    #[test]
    fn test_oversized_request_is_not_pooled() {
        let pool = BufferPool::new();
        {
            let buffer = pool.acquire(MAX_CLASS_SIZE * 2);
            assert!(buffer.capacity() >= MAX_CLASS_SIZE * 2);
        }
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_release_is_automatic_on_every_exit_path() {
        let pool = BufferPool::with_class_capacity(4);
        let result: Result<(), ()> = (|| {
            let _buffer = pool.acquire(MIN_CLASS_SIZE);
            Err(())
        })();
        assert!(result.is_err());
        assert_eq!(pool.pooled_count(), 1);
    }
}
