use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// A display-ready frame: tightly packed RGBA pixels plus the presentation
/// timestamp in seconds and the display aspect multiplier derived from the
/// stream's sample aspect ratio.
pub struct Picture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pts: f64,
    pub aspect: f64,
}

/// Single-slot rendezvous between the video decoder and the refresh
/// scheduler. Capacity one on purpose: holding more than the next picture
/// would trade sync precision for buffering.
///
/// The producer blocks while the slot is full; the consumer never blocks
/// (an empty slot makes the refresh tick re-check a millisecond later).
pub struct PictureQueue {
    slot: Mutex<Option<Picture>>,
    cond: Condvar,
    aborted: AtomicBool,
}

impl PictureQueue {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Waits for the slot to free, then stores the picture. Returns `false`
    /// when the queue was aborted while waiting; the producer should exit.
    #[must_use]
    pub fn put(&self, picture: Picture) -> bool {
        let mut slot = self.slot.lock();
        while slot.is_some() && !self.aborted.load(Ordering::Acquire) {
            self.cond.wait(&mut slot);
        }
        if self.aborted.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(picture);
        true
    }

    /// Non-blocking take; frees the slot and wakes the producer.
    pub fn take(&self) -> Option<Picture> {
        let picture = self.slot.lock().take();
        if picture.is_some() {
            self.cond.notify_one();
        }
        picture
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Discards any queued picture and releases a blocked producer for
    /// shutdown.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.slot.lock().take();
        self.cond.notify_all();
    }
}

impl Default for PictureQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    fn picture(pts: f64) -> Picture {
        Picture {
            data: vec![0; 16],
            width: 2,
            height: 2,
            pts,
            aspect: 1.0,
        }
    }

    #[test]
    fn take_on_empty_returns_none() {
        let queue = PictureQueue::new();
        assert!(queue.take().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn put_then_take_round_trips() {
        let queue = PictureQueue::new();
        assert!(queue.put(picture(1.5)));
        assert!(!queue.is_empty());
        let got = queue.take().expect("slot should be full");
        assert_eq!(got.pts, 1.5);
        assert!(queue.is_empty());
    }

    #[test]
    fn producer_blocks_until_consumer_takes() {
        let queue = Arc::new(PictureQueue::new());
        assert!(queue.put(picture(1.0)));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put(picture(2.0)))
        };
        // the second put must still be parked on the full slot
        thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());

        assert_eq!(queue.take().unwrap().pts, 1.0);
        assert!(producer.join().unwrap());
        assert_eq!(queue.take().unwrap().pts, 2.0);
    }

    #[test]
    fn abort_releases_blocked_producer() {
        let queue = Arc::new(PictureQueue::new());
        assert!(queue.put(picture(1.0)));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put(picture(2.0)))
        };
        thread::sleep(Duration::from_millis(30));
        queue.abort();
        assert!(!producer.join().unwrap());
        assert!(queue.take().is_none());
    }
}
