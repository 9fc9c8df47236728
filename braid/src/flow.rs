//! Flow-control windows and writer scheduling.
//!
//! Windows are signed 32-bit with RFC 9000 semantics: the count may go
//! negative when a settings change shrinks the initial window while bytes
//! are in flight. The largest legal window is `0x7fffffff`; growing past
//! it is a flow-control error, and a zero-valued window update is a
//! protocol error.
//!
//! Writers blocked on a window park in a FIFO queue and wake in arrival
//! order once the effective window is positive again.

use std::collections::VecDeque;
use std::task::Waker;

use thiserror::Error;

/// The largest legal flow-control window.
pub const MAX_WINDOW: i32 = 0x7fff_ffff;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// A window was pushed past `0x7fffffff`.
    #[error("flow-control window overflow")]
    Overflow,

    /// A window update carried a zero increment.
    #[error("zero-valued window update")]
    ZeroUpdate,

    /// A window update carried an increment above `0x7fffffff`.
    #[error("window update too large")]
    UpdateTooLarge,
}

/// One direction's flow-control window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window(i64);

impl Window {
    /// Initial windows above the legal maximum are clamped.
    pub fn new(initial: u32) -> Self {
        Self(initial.min(MAX_WINDOW as u32) as i64)
    }

    /// Bytes currently available, zero when the window is exhausted or
    /// negative.
    pub fn available(&self) -> usize {
        self.0.max(0) as usize
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Debit `n` bytes. Callers never consume more than `available()`.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.0 -= n as i64;
    }

    /// Apply a window update granting `n` more bytes.
    pub fn credit(&mut self, n: u64) -> Result<(), FlowError> {
        if n == 0 {
            return Err(FlowError::ZeroUpdate);
        }
        if n > MAX_WINDOW as u64 {
            return Err(FlowError::UpdateTooLarge);
        }
        let next = self.0 + n as i64;
        if next > MAX_WINDOW as i64 {
            return Err(FlowError::Overflow);
        }
        self.0 = next;
        Ok(())
    }

    /// Shift the window when the initial window size is revised by a
    /// settings change. The delta may be negative; a window may legally go
    /// negative, but overflow past the maximum is an error.
    pub fn adjust(&mut self, delta: i64) -> Result<(), FlowError> {
        let next = self.0 + delta;
        if next > MAX_WINDOW as i64 {
            return Err(FlowError::Overflow);
        }
        self.0 = next;
        Ok(())
    }
}

/// Streams with data ready, in submission order, waiting for window.
#[derive(Debug)]
pub struct WriterQueue<K = u64> {
    queue: VecDeque<(K, Waker)>,
}

impl<K> Default for WriterQueue<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<K: Copy + PartialEq> WriterQueue<K> {
    /// Park a writer. A stream parks at most once; re-parking replaces the
    /// stored waker in place so the queue position is preserved.
    pub fn park(&mut self, stream: K, waker: Waker) {
        if let Some((_, slot)) = self.queue.iter_mut().find(|(id, _)| *id == stream) {
            *slot = waker;
        } else {
            self.queue.push_back((stream, waker));
        }
    }

    /// Remove a parked writer without waking it (reset/shutdown paths).
    pub fn cancel(&mut self, stream: K) {
        self.queue.retain(|(id, _)| *id != stream);
    }

    /// Pop the writer that has waited longest.
    pub fn pop(&mut self) -> Option<(K, Waker)> {
        self.queue.pop_front()
    }

    /// Pop the longest-waiting writer that passes the eligibility check,
    /// preserving the order of everything it skips.
    pub fn pop_eligible(&mut self, mut eligible: impl FnMut(K) -> bool) -> Option<(K, Waker)> {
        let pos = self.queue.iter().position(|(id, _)| eligible(*id))?;
        self.queue.remove(pos)
    }

    /// Drain every parked writer, for connection-level teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = Waker> + '_ {
        self.queue.drain(..).map(|(_, waker)| waker)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn consume_then_credit() {
        let mut w = Window::new(16384);
        assert_eq!(w.available(), 16384);

        w.consume(16384);
        assert_eq!(w.available(), 0);
        assert!(!w.is_positive());

        w.credit(100).unwrap();
        assert_eq!(w.available(), 100);
    }

    #[test]
    fn sender_emits_min_of_data_and_credit() {
        // For writes totaling N and updates totaling W, exactly
        // min(N, initial + W) bytes fit before blocking.
        let initial = 1000u32;
        let updates = [400u64, 250];
        let n = 5000usize;

        let mut w = Window::new(initial);
        let mut sent = 0;
        let mut updates = updates.iter();
        loop {
            let take = w.available().min(n - sent);
            if take == 0 {
                match updates.next() {
                    Some(&u) => {
                        w.credit(u).unwrap();
                        continue;
                    }
                    None => break,
                }
            }
            w.consume(take);
            sent += take;
            if sent == n {
                break;
            }
        }

        let granted = initial as usize + 400 + 250;
        assert_eq!(sent, n.min(granted));
    }

    #[test]
    fn partial_credit_completes_pending_writer() {
        // Window advertised as 16384. A 16384-byte write fills it; the
        // next write parks; a 100-byte credit completes the parked write
        // with exactly 100 bytes, leaving 16285 pending.
        let mut w = Window::new(16384);
        let mut q = WriterQueue::default();
        let woken = Arc::new(AtomicUsize::new(0));

        let first = w.available().min(16384);
        w.consume(first);
        assert_eq!(first, 16384);

        // Second write: one byte more than the window fits; no credit
        // left, so the writer parks.
        let second_len = 16385usize;
        assert_eq!(w.available(), 0);
        q.park(4u64, counting_waker(woken.clone()));

        // The reader consumes 100 bytes and the window update arrives.
        w.credit(100).unwrap();
        let (id, waker) = q
            .pop_eligible(|_| w.is_positive())
            .expect("writer wakes on credit");
        assert_eq!(id, 4);
        waker.wake();
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        // The woken writer completes with exactly the credited amount.
        let accepted = w.available().min(second_len);
        w.consume(accepted);
        assert_eq!(accepted, 100);
        assert_eq!(second_len - accepted, 16285);

        // Nothing more fits until another update: draining the rest
        // would need exactly 16285 further credits.
        assert_eq!(w.available(), 0);
        w.credit(16285).unwrap();
        assert_eq!(w.available(), 16285);
    }

    #[test]
    fn update_rules() {
        let mut w = Window::new(10);
        assert_eq!(w.credit(0), Err(FlowError::ZeroUpdate));
        assert_eq!(
            w.credit(MAX_WINDOW as u64 + 1),
            Err(FlowError::UpdateTooLarge)
        );
        assert_eq!(w.credit(MAX_WINDOW as u64), Err(FlowError::Overflow));
        // Failed updates leave the window untouched.
        assert_eq!(w.available(), 10);
    }

    #[test]
    fn overflow_boundary() {
        let mut w = Window::new(1);
        assert_eq!(w.credit(MAX_WINDOW as u64 - 1), Ok(()));
        assert_eq!(w.available(), MAX_WINDOW as usize);

        let mut w = Window::new(0);
        w.credit(MAX_WINDOW as u64).unwrap();
        assert_eq!(w.credit(1), Err(FlowError::Overflow));
    }

    #[test]
    fn settings_shift_can_go_negative() {
        let mut w = Window::new(100);
        w.consume(80);

        // Peer shrinks the initial window from 100 to 10.
        w.adjust(-90).unwrap();
        assert_eq!(w.available(), 0);
        assert!(!w.is_positive());

        // Credits must first pay off the deficit.
        w.credit(60).unwrap();
        assert!(!w.is_positive());
        w.credit(11).unwrap();
        assert_eq!(w.available(), 1);
    }

    #[test]
    fn settings_shift_overflow() {
        let mut w = Window::new(MAX_WINDOW as u32);
        assert_eq!(w.adjust(1), Err(FlowError::Overflow));
        assert_eq!(w.adjust(-1), Ok(()));
    }

    fn counting_waker(counter: Arc<AtomicUsize>) -> Waker {
        struct W(Arc<AtomicUsize>);
        impl std::task::Wake for W {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        Waker::from(Arc::new(W(counter)))
    }

    #[test]
    fn writers_wake_fifo() {
        let mut q = WriterQueue::default();
        let counter = Arc::new(AtomicUsize::new(0));

        for id in [4u64, 8, 0] {
            q.park(id, counting_waker(counter.clone()));
        }

        // Re-parking does not lose the queue position.
        q.park(8, counting_waker(counter.clone()));

        assert_eq!(q.pop().unwrap().0, 4);
        assert_eq!(q.pop().unwrap().0, 8);
        assert_eq!(q.pop().unwrap().0, 0);
        assert!(q.pop().is_none());
    }

    #[test]
    fn cancel_removes_without_waking() {
        let mut q = WriterQueue::default();
        let counter = Arc::new(AtomicUsize::new(0));
        q.park(1, counting_waker(counter.clone()));
        q.park(2, counting_waker(counter.clone()));

        q.cancel(1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(q.pop().unwrap().0, 2);
        assert!(q.is_empty());
    }
}
