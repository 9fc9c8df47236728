//! The asynchronous operation model.
//!
//! An operation is a result slot plus the waker of the future that
//! submitted it. State machines hold the pending operation inside the
//! sub-state it belongs to; completing it detaches it from the state,
//! fills the slot, and yields the waker.
//!
//! Wakers returned from completion sites MUST NOT be woken while the
//! engine lock is held. Every public entry point drains its [WakeList]
//! after releasing the lock, so a handler never observes the lock held.

use std::task::{Context, Poll, Waker};

/// The largest number of buffer fragments a vectored operation accepts.
pub const MAX_FRAGMENTS: usize = 128;

/// A pending operation: the submitting future's waker, plus a slot the
/// engine fills when it completes the operation with an error or
/// out-of-band result.
#[derive(Debug)]
pub(crate) struct Op<T> {
    waker: Waker,
    result: Option<T>,
}

impl<T> Op<T> {
    pub fn new(cx: &mut Context<'_>) -> Self {
        Self {
            waker: cx.waker().clone(),
            result: None,
        }
    }

    /// Re-arm with the waker of the latest poll.
    pub fn register(&mut self, cx: &mut Context<'_>) {
        self.waker.clone_from(cx.waker());
    }

    /// Complete with a result, yielding the waker.
    #[must_use = "wake outside the engine lock"]
    pub fn complete(mut self, result: T) -> (CompletedOp<T>, Waker) {
        self.result = Some(result);
        let waker = self.waker.clone();
        (CompletedOp(self), waker)
    }

    /// The future collecting the result, if the engine filled the slot.
    pub fn take_result(&mut self) -> Option<T> {
        self.result.take()
    }

    /// A clone of the registered waker, for wake-without-detach.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Consume the operation, yielding the filled slot if any.
    pub fn into_result(mut self) -> Option<T> {
        self.result.take()
    }
}

/// An operation that has been detached from its state and completed.
///
/// Holding this type proves the slot is filled; the state machine parks it
/// where the collecting future will find it.
#[derive(Debug)]
pub(crate) struct CompletedOp<T>(Op<T>);

impl<T> CompletedOp<T> {
    pub fn into_inner(self) -> Op<T> {
        self.0
    }
}

/// Wakers deferred until the engine lock drops.
///
/// Completions discovered while processing the protocol machine are pushed
/// here; the caller drains the list once the lock is released.
#[derive(Default, Debug)]
pub(crate) struct WakeList {
    wakers: Vec<Waker>,
}

impl WakeList {
    pub fn push(&mut self, waker: Waker) {
        self.wakers.push(waker);
    }

    pub fn extend(&mut self, wakers: impl IntoIterator<Item = Waker>) {
        self.wakers.extend(wakers);
    }

    pub fn is_empty(&self) -> bool {
        self.wakers.is_empty()
    }

    /// Wake everything. Call with no locks held.
    pub fn wake(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}

impl Drop for WakeList {
    fn drop(&mut self) {
        // Teardown must not strand futures even if a caller forgets to
        // drain; this is the destroy path, which still wakes so futures
        // can observe the terminal state.
        self.wake();
    }
}

/// Poll helper: either the slot already holds a result, or the side-state
/// owner re-registers and stays pending.
pub(crate) fn poll_slot<T>(op: &mut Op<T>, cx: &mut Context<'_>) -> Poll<T> {
    match op.take_result() {
        Some(result) => Poll::Ready(result),
        None => {
            op.register(cx);
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn complete_delivers_once() {
        let slot: Arc<Mutex<Option<Op<u32>>>> = Arc::default();

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move {
                poll_fn(|cx| {
                    let mut guard = slot.lock().unwrap();
                    match guard.as_mut() {
                        Some(op) => poll_slot(op, cx),
                        None => {
                            *guard = Some(Op::new(cx));
                            Poll::Pending
                        }
                    }
                })
                .await
            })
        };

        // Let the waiter register.
        tokio::task::yield_now().await;

        let waker = loop {
            let mut guard = slot.lock().unwrap();
            if let Some(op) = guard.take() {
                let (done, waker) = op.complete(7);
                *guard = Some(done.into_inner());
                break waker;
            }
            drop(guard);
            tokio::task::yield_now().await;
        };
        waker.wake();

        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[test]
    fn wake_list_drains() {
        let mut list = WakeList::default();
        assert!(list.is_empty());

        let woken = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..3 {
            let woken = woken.clone();
            list.push(Waker::from(Arc::new(CountWaker(woken))));
        }
        assert!(!list.is_empty());

        list.wake();
        assert_eq!(woken.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(list.is_empty());
    }

    struct CountWaker(Arc<std::sync::atomic::AtomicUsize>);

    impl std::task::Wake for CountWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }
}
