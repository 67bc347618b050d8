// SPDX-License-Identifier: GPL-3.0-only

//! Single-slot frame relay between the capture thread and one consumer
//!
//! The relay is a rendezvous mailbox, not a queue: it holds at most one unread
//! [`FrameSnapshot`]. The producer blocks in [`FramePublisher::publish`] while a
//! frame is pending, and the consumer blocks in [`FrameSubscriber::take`] while
//! the mailbox is empty. Frames are therefore seen in production order, each
//! exactly once, and capture is throttled to the consumer's pace instead of
//! building a backlog.
//!
//! # Construction contract
//!
//! [`channel`] returns a relay in the `Empty` state with the slot already free:
//! the first `publish` never waits, whether or not the consumer has started.
//!
//! # Liveness
//!
//! There is no timeout. If the consumer stops calling `take`, the next
//! `publish` blocks until the relay is closed, which happens when either
//! handle is dropped or `close()` is called on a handle or a [`RelayCloser`].
//! Supervisors use that to unblock a stalled producer.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::backends::camera::types::FrameSnapshot;
use crate::errors::RelayError;

/// Mailbox state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No unread frame
    Empty,
    /// A published frame is waiting for the consumer
    Ready,
}

/// Point-in-time view of the relay counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub state: RelayState,
    pub published: u64,
    pub consumed: u64,
    pub closed: bool,
}

struct Mailbox {
    slot: Option<FrameSnapshot>,
    published: u64,
    consumed: u64,
    closed: bool,
}

impl Mailbox {
    fn state(&self) -> RelayState {
        if self.slot.is_some() {
            RelayState::Ready
        } else {
            RelayState::Empty
        }
    }
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    frame_ready: Condvar,
    slot_free: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Mailbox> {
        // Mailbox updates are single assignments; a panicking peer cannot leave it torn
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut mailbox = self.lock();
        if !mailbox.closed {
            debug!(
                published = mailbox.published,
                consumed = mailbox.consumed,
                "Closing frame relay"
            );
            mailbox.closed = true;
        }
        drop(mailbox);
        self.frame_ready.notify_all();
        self.slot_free.notify_all();
    }

    fn stats(&self) -> RelayStats {
        let mailbox = self.lock();
        RelayStats {
            state: mailbox.state(),
            published: mailbox.published,
            consumed: mailbox.consumed,
            closed: mailbox.closed,
        }
    }
}

/// Create a connected producer/consumer pair
///
/// The relay starts `Empty` with the slot free, so the first publish goes
/// straight through.
pub fn channel() -> (FramePublisher, FrameSubscriber) {
    let shared = Arc::new(Shared {
        mailbox: Mutex::new(Mailbox {
            slot: None,
            published: 0,
            consumed: 0,
            closed: false,
        }),
        frame_ready: Condvar::new(),
        slot_free: Condvar::new(),
    });

    (
        FramePublisher {
            shared: Arc::clone(&shared),
        },
        FrameSubscriber { shared },
    )
}

/// Producer half of the relay (capture thread)
pub struct FramePublisher {
    shared: Arc<Shared>,
}

impl FramePublisher {
    /// Hand a frame to the consumer
    ///
    /// Blocks while the previous frame is still unread. If the relay is closed
    /// the frame is returned inside the error.
    pub fn publish(&self, snapshot: FrameSnapshot) -> Result<(), RelayError> {
        let mut mailbox = self.shared.lock();
        while mailbox.slot.is_some() && !mailbox.closed {
            mailbox = self
                .shared
                .slot_free
                .wait(mailbox)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if mailbox.closed {
            return Err(RelayError::Closed(Some(snapshot)));
        }

        mailbox.slot = Some(snapshot);
        mailbox.published += 1;
        debug_assert_eq!(mailbox.published, mailbox.consumed + 1);
        drop(mailbox);

        self.shared.frame_ready.notify_one();
        Ok(())
    }

    /// Handle that can close the relay from another thread
    pub fn closer(&self) -> RelayCloser {
        RelayCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn stats(&self) -> RelayStats {
        self.shared.stats()
    }
}

impl Drop for FramePublisher {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Consumer half of the relay
pub struct FrameSubscriber {
    shared: Arc<Shared>,
}

impl FrameSubscriber {
    /// Wait for the next frame and take it
    ///
    /// A frame published before the relay closed is still delivered; after
    /// that, `take` returns [`RelayError::Closed`].
    pub fn take(&self) -> Result<FrameSnapshot, RelayError> {
        let mut mailbox = self.shared.lock();
        while mailbox.slot.is_none() && !mailbox.closed {
            mailbox = self
                .shared
                .frame_ready
                .wait(mailbox)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let snapshot = mailbox.slot.take().ok_or(RelayError::Closed(None))?;
        mailbox.consumed += 1;
        debug_assert_eq!(mailbox.published, mailbox.consumed);
        drop(mailbox);

        self.shared.slot_free.notify_one();
        Ok(snapshot)
    }

    /// Take the pending frame if there is one, without waiting
    pub fn try_take(&self) -> Result<Option<FrameSnapshot>, RelayError> {
        let mut mailbox = self.shared.lock();
        match mailbox.slot.take() {
            Some(snapshot) => {
                mailbox.consumed += 1;
                drop(mailbox);
                self.shared.slot_free.notify_one();
                Ok(Some(snapshot))
            }
            None if mailbox.closed => Err(RelayError::Closed(None)),
            None => Ok(None),
        }
    }

    pub fn closer(&self) -> RelayCloser {
        RelayCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn stats(&self) -> RelayStats {
        self.shared.stats()
    }
}

impl Drop for FrameSubscriber {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Closes a relay without being either endpoint
#[derive(Clone)]
pub struct RelayCloser {
    shared: Arc<Shared>,
}

impl RelayCloser {
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::{PixelFormat, SnapshotLayout};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn frame(n: u64) -> FrameSnapshot {
        FrameSnapshot {
            width: 2,
            height: 1,
            pixel_format: PixelFormat::Uyvy,
            layout: SnapshotLayout::Native,
            data: Arc::from(vec![n as u8; 4]),
            frame_number: n,
            sequence: n as u32,
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn test_first_publish_does_not_wait() {
        let (tx, rx) = channel();
        assert_eq!(tx.stats().state, RelayState::Empty);
        tx.publish(frame(1)).unwrap();
        assert_eq!(tx.stats().state, RelayState::Ready);
        assert_eq!(rx.take().unwrap().frame_number, 1);
        assert_eq!(rx.stats().state, RelayState::Empty);
    }

    #[test]
    fn test_second_publish_blocks_until_take() {
        let (tx, rx) = channel();
        tx.publish(frame(1)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let producer = thread::spawn(move || {
            tx.publish(frame(2)).unwrap();
            done_tx.send(()).unwrap();
            tx
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(rx.take().unwrap().frame_number, 1);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rx.take().unwrap().frame_number, 2);
        drop(producer.join().unwrap());
    }

    #[test]
    fn test_try_take_on_empty_relay() {
        let (tx, rx) = channel();
        assert!(rx.try_take().unwrap().is_none());
        tx.publish(frame(7)).unwrap();
        assert_eq!(rx.try_take().unwrap().unwrap().frame_number, 7);
        assert!(rx.try_take().unwrap().is_none());
    }

    #[test]
    fn test_close_returns_rejected_frame() {
        let (tx, rx) = channel();
        tx.publish(frame(1)).unwrap();
        rx.close();
        match tx.publish(frame(2)) {
            Err(RelayError::Closed(Some(rejected))) => assert_eq!(rejected.frame_number, 2),
            other => panic!("unexpected publish result: {:?}", other),
        }
    }

    #[test]
    fn test_pending_frame_survives_producer_drop() {
        let (tx, rx) = channel();
        tx.publish(frame(1)).unwrap();
        drop(tx);
        assert_eq!(rx.take().unwrap().frame_number, 1);
        assert!(matches!(rx.take(), Err(RelayError::Closed(None))));
    }

    #[test]
    fn test_counters_alternate() {
        let (tx, rx) = channel();
        for n in 1..=5 {
            tx.publish(frame(n)).unwrap();
            let stats = rx.stats();
            assert_eq!(stats.published, n);
            assert_eq!(stats.consumed, n - 1);
            rx.take().unwrap();
            assert_eq!(rx.stats().consumed, n);
        }
    }
}
