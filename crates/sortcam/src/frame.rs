//! Latest-frame slot shared between the camera producer and every viewer
//!
//! The camera is the only writer. Each publish replaces the slot and bumps a
//! version counter; readers wait for "anything newer than what I last saw".
//! Slow readers skip intermediate frames (at-most-latest delivery), and the
//! producer never waits on them.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::trace;

/// JPEG start-of-image marker
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// One encoded image and the version it was published under.
///
/// Versions start at 1; 0 means "nothing seen yet" for waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Monotonic publish counter
    pub version: u64,
    /// Encoded image bytes (JPEG for the MJPEG stream)
    pub data: Bytes,
}

impl Frame {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Default)]
struct Slot {
    latest: Option<Frame>,
    version: u64,
}

impl Slot {
    fn newer_than(&self, last_seen: u64) -> Option<Frame> {
        self.latest
            .as_ref()
            .filter(|frame| frame.version > last_seen)
            .cloned()
    }
}

/// Single-slot, thread-safe holder of the most recent frame.
///
/// Blocking waiters park on a condition variable, async waiters on a
/// [`Notify`]; both are released on every publish.
#[derive(Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
    ready: Condvar,
    notify: Notify,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // The slot is replaced with a single assignment, so a poisoned lock
    // still guards a whole frame.
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new frame and wake every waiter. Returns its version.
    pub fn publish(&self, data: impl Into<Bytes>) -> u64 {
        let data = data.into();
        let len = data.len();
        let version = {
            let mut slot = self.slot();
            slot.version += 1;
            let version = slot.version;
            slot.latest = Some(Frame { version, data });
            version
        };
        self.ready.notify_all();
        self.notify.notify_waiters();
        trace!(version, len, "Frame published");
        version
    }

    /// Capture callback: publish `chunk` if it begins a JPEG image.
    ///
    /// Chunks that do not start with the SOI marker are continuation data
    /// from the camera and are dropped. Returns the new version if published.
    pub fn write(&self, chunk: &[u8]) -> Option<u64> {
        if chunk.starts_with(&JPEG_SOI) {
            Some(self.publish(Bytes::copy_from_slice(chunk)))
        } else {
            None
        }
    }

    /// Most recent frame, if any has been published
    pub fn latest(&self) -> Option<Frame> {
        self.slot().latest.clone()
    }

    /// Version of the most recent frame (also the total number published)
    pub fn version(&self) -> u64 {
        self.slot().version
    }

    /// Block the calling thread until a frame newer than `last_seen` exists.
    pub fn wait_next(&self, last_seen: u64) -> Frame {
        let mut slot = self.slot();
        loop {
            if let Some(frame) = slot.newer_than(last_seen) {
                return frame;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_next`](Self::wait_next) but gives up after `timeout`.
    pub fn wait_next_timeout(&self, last_seen: u64, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        loop {
            if let Some(frame) = slot.newer_than(last_seen) {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .ready
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Async twin of [`wait_next`](Self::wait_next) for the HTTP runtime.
    pub async fn wait_next_async(&self, last_seen: u64) -> Frame {
        loop {
            // Register before checking so a publish between the check and
            // the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let newer = self.slot().newer_than(last_seen);
            if let Some(frame) = newer {
                return frame;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// Payload whose every byte is derived from the version, so a torn
    /// read would show mixed bytes.
    fn payload(version: u64, len: usize) -> Vec<u8> {
        vec![(version % 251) as u8; len]
    }

    #[test]
    fn empty_buffer_has_no_frame() {
        let buffer = FrameBuffer::new();
        assert!(buffer.latest().is_none());
        assert_eq!(buffer.version(), 0);
    }

    #[test]
    fn publish_bumps_version() {
        let buffer = FrameBuffer::new();
        assert_eq!(buffer.publish(Bytes::from_static(b"a")), 1);
        assert_eq!(buffer.publish(Bytes::from_static(b"b")), 2);

        let latest = buffer.latest().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.data, Bytes::from_static(b"b"));
        assert_eq!(latest.len(), 1);
    }

    #[test]
    fn write_only_publishes_jpeg_starts() {
        let buffer = FrameBuffer::new();
        assert_eq!(buffer.write(&[0x00, 0x01, 0x02]), None);
        assert_eq!(buffer.write(&[]), None);
        assert_eq!(buffer.write(&[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]), Some(1));
        assert_eq!(buffer.version(), 1);
    }

    #[test]
    fn wait_next_returns_existing_newer_frame_immediately() {
        let buffer = FrameBuffer::new();
        buffer.publish(Bytes::from_static(b"a"));

        let frame = buffer.wait_next(0);
        assert_eq!(frame.version, 1);
        assert_eq!(frame.data, Bytes::from_static(b"a"));
    }

    #[test]
    fn wait_next_timeout_expires_when_already_latest() {
        let buffer = FrameBuffer::new();
        buffer.publish(Bytes::from_static(b"a"));

        assert!(buffer
            .wait_next_timeout(1, Duration::from_millis(20))
            .is_none());
        assert!(buffer
            .wait_next_timeout(0, Duration::from_millis(20))
            .is_some());
    }

    #[test]
    fn blocked_waiter_is_released_by_publish() {
        let buffer = Arc::new(FrameBuffer::new());
        let waiter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.wait_next(0))
        };

        thread::sleep(Duration::from_millis(20));
        buffer.publish(Bytes::from_static(b"x"));

        let frame = waiter.join().unwrap();
        assert_eq!(frame.version, 1);
    }

    #[test]
    fn looping_waiter_sees_increasing_untorn_versions() {
        let buffer = Arc::new(FrameBuffer::new());
        const FRAMES: u64 = 500;

        let reader = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut last = 0;
                let mut seen = Vec::new();
                while last < FRAMES {
                    let frame = buffer.wait_next(last);
                    assert!(frame.version > last, "version went backwards");
                    assert_eq!(&frame.data[..], &payload(frame.version, 4096)[..]);
                    last = frame.version;
                    seen.push(last);
                }
                seen
            })
        };

        for v in 1..=FRAMES {
            buffer.publish(payload(v, 4096));
        }

        let seen = reader.join().unwrap();
        assert_eq!(*seen.last().unwrap(), FRAMES);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn two_waiters_never_repeat_a_version() {
        let buffer = Arc::new(FrameBuffer::new());
        const FRAMES: u64 = 200;

        let spawn_reader = |buffer: Arc<FrameBuffer>| {
            thread::spawn(move || {
                let mut last = buffer.version();
                let mut seen = Vec::new();
                while last < FRAMES {
                    let frame = buffer.wait_next(last);
                    last = frame.version;
                    seen.push(last);
                }
                seen
            })
        };

        let early = spawn_reader(Arc::clone(&buffer));
        for v in 1..=FRAMES / 2 {
            buffer.publish(payload(v, 64));
        }
        let late = spawn_reader(Arc::clone(&buffer));
        for v in FRAMES / 2 + 1..=FRAMES {
            buffer.publish(payload(v, 64));
            if v % 10 == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        for seen in [early.join().unwrap(), late.join().unwrap()] {
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(*seen.last().unwrap(), FRAMES);
        }
    }

    #[tokio::test]
    async fn async_waiter_is_woken_by_publish() {
        let buffer = Arc::new(FrameBuffer::new());
        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.wait_next_async(0).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.publish(Bytes::from_static(b"first"));

        let frame = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
        assert_eq!(frame.version, 1);
        assert_eq!(frame.data, Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn async_waiter_skips_to_latest() {
        let buffer = FrameBuffer::new();
        buffer.publish(Bytes::from_static(b"1"));
        buffer.publish(Bytes::from_static(b"2"));
        buffer.publish(Bytes::from_static(b"3"));

        let frame = buffer.wait_next_async(1).await;
        assert_eq!(frame.version, 3);
        assert_eq!(frame.data, Bytes::from_static(b"3"));
    }
}
