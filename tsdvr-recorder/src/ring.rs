//! Bounded byte ring between the receiving callback and the recorder
//! worker.
//!
//! Single producer, single consumer. The producer side never blocks: a
//! put stores what fits and reports the rest as dropped. The consumer
//! side peeks with a deadline and consumes explicitly, so a partially
//! processed burst stays in the buffer.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Inner {
    buf: Box<[u8]>,
    read: usize,
    len: usize,
}

pub struct RingBuffer {
    inner: Mutex<Inner>,
    readable: Condvar,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read: 0,
                len: 0,
            }),
            readable: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently stored.
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    /// Store as much of `data` as fits; returns the number of bytes
    /// actually enqueued. Never blocks.
    pub fn put(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let free = self.capacity - inner.len;
        let to_write = data.len().min(free);
        if to_write == 0 {
            return 0;
        }
        let write = (inner.read + inner.len) % self.capacity;
        let first = to_write.min(self.capacity - write);
        inner.buf[write..write + first].copy_from_slice(&data[..first]);
        if first < to_write {
            let second = to_write - first;
            inner.buf[..second].copy_from_slice(&data[first..to_write]);
        }
        inner.len += to_write;
        drop(inner);
        self.readable.notify_one();
        to_write
    }

    /// Copy up to `out.len()` bytes from the front of the buffer without
    /// consuming them, waiting up to `timeout` for data to arrive.
    /// Returns the number of bytes copied (0 on timeout).
    pub fn get(&self, out: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.len == 0 {
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .readable
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
        let to_read = out.len().min(inner.len);
        let first = to_read.min(self.capacity - inner.read);
        out[..first].copy_from_slice(&inner.buf[inner.read..inner.read + first]);
        if first < to_read {
            out[first..to_read].copy_from_slice(&inner.buf[..to_read - first]);
        }
        to_read
    }

    /// Consume `count` bytes previously seen via [`get`](Self::get).
    pub fn del(&self, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        let count = count.min(inner.len);
        inner.read = (inner.read + count) % self.capacity;
        inner.len -= count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_get_del() {
        let ring = RingBuffer::new(1024);
        assert_eq!(ring.capacity(), 1024);
        assert_eq!(ring.put(&[1, 2, 3, 4]), 4);
        assert_eq!(ring.available(), 4);

        let mut out = [0u8; 16];
        let n = ring.get(&mut out, Duration::from_millis(10));
        assert_eq!(n, 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);

        // A peek does not consume.
        assert_eq!(ring.available(), 4);
        ring.del(2);
        assert_eq!(ring.available(), 2);
        let n = ring.get(&mut out, Duration::from_millis(10));
        assert_eq!(n, 2);
        assert_eq!(&out[..2], &[3, 4]);
    }

    #[test]
    fn test_overflow_is_partial() {
        let ring = RingBuffer::new(10);
        assert_eq!(ring.put(&[0u8; 8]), 8);
        assert_eq!(ring.put(&[0u8; 8]), 2);
        assert_eq!(ring.put(&[0u8; 8]), 0);
    }

    #[test]
    fn test_wrap_around() {
        let ring = RingBuffer::new(10);
        assert_eq!(ring.put(&[1, 2, 3, 4, 5, 6, 7, 8]), 8);
        ring.del(6);
        assert_eq!(ring.put(&[9, 10, 11, 12, 13, 14]), 6);

        let mut out = [0u8; 10];
        let n = ring.get(&mut out, Duration::from_millis(10));
        assert_eq!(n, 8);
        assert_eq!(&out[..8], &[7, 8, 9, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_get_times_out_when_empty() {
        let ring = RingBuffer::new(16);
        let mut out = [0u8; 4];
        let start = Instant::now();
        assert_eq!(ring.get(&mut out, Duration::from_millis(20)), 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_get_wakes_on_put() {
        let ring = Arc::new(RingBuffer::new(16));
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ring.put(&[42]);
            })
        };
        let mut out = [0u8; 4];
        let n = ring.get(&mut out, Duration::from_secs(5));
        assert_eq!(n, 1);
        assert_eq!(out[0], 42);
        producer.join().unwrap();
    }
}
