//! Single-assignment promises for async tests

use std::cell::RefCell;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::TestError;

enum Settlement<T> {
    /// Only one reader exists, so at most one waker is parked.
    Pending(Option<Waker>),
    Fulfilled(T),
    Rejected(TestError),
    Consumed,
}

/// Read side of a promise. Await it with
/// [`TestContext::await_promise`](super::TestContext::await_promise).
pub struct Promise<T> {
    shared: Rc<RefCell<Settlement<T>>>,
}

/// Write side of a promise. The first `resolve`/`reject` wins.
pub struct Resolver<T> {
    shared: Rc<RefCell<Settlement<T>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Create a pending promise and its resolver.
pub fn promise<T>() -> (Promise<T>, Resolver<T>) {
    let shared = Rc::new(RefCell::new(Settlement::Pending(None)));
    (
        Promise {
            shared: shared.clone(),
        },
        Resolver { shared },
    )
}

impl<T> Promise<T> {
    /// An already fulfilled promise.
    pub fn resolved(value: T) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Settlement::Fulfilled(value))),
        }
    }

    /// An already rejected promise.
    pub fn rejected(err: impl Into<TestError>) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Settlement::Rejected(err.into()))),
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.shared.borrow(), Settlement::Pending(_))
    }

    pub(crate) fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<Result<T, TestError>> {
        let mut slot = self.shared.borrow_mut();
        match std::mem::replace(&mut *slot, Settlement::Consumed) {
            Settlement::Pending(parked) => {
                let waker = match parked {
                    Some(w) if w.will_wake(cx.waker()) => w,
                    _ => cx.waker().clone(),
                };
                *slot = Settlement::Pending(Some(waker));
                Poll::Pending
            }
            Settlement::Fulfilled(value) => Poll::Ready(Ok(value)),
            Settlement::Rejected(err) => Poll::Ready(Err(err)),
            Settlement::Consumed => Poll::Ready(Err(TestError::raised(
                "promise result was already consumed",
            ))),
        }
    }
}

impl<T> Resolver<T> {
    /// Fulfil the promise. Returns `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Fulfilled(value))
    }

    /// Reject the promise. Returns `false` if it was already settled.
    pub fn reject(&self, err: impl Into<TestError>) -> bool {
        self.settle(Settlement::Rejected(err.into()))
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.shared.borrow(), Settlement::Pending(_))
    }

    #[cfg(test)]
    pub(crate) fn parked_wakers(&self) -> usize {
        match &*self.shared.borrow() {
            Settlement::Pending(parked) => usize::from(parked.is_some()),
            _ => 0,
        }
    }

    fn settle(&self, outcome: Settlement<T>) -> bool {
        let parked = {
            let mut slot = self.shared.borrow_mut();
            match &mut *slot {
                Settlement::Pending(parked) => {
                    let parked = parked.take();
                    *slot = outcome;
                    parked
                }
                _ => return false,
            }
        };
        if let Some(waker) = parked {
            waker.wake();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_settlement_wins() {
        let (p, r) = promise::<u8>();
        assert!(!p.is_settled());
        assert!(r.resolve(1));
        assert!(!r.reject("late"));
        assert!(!r.clone().resolve(2));
        assert!(p.is_settled());
        assert!(r.is_settled());
    }

    #[test]
    fn test_poll_consumes_value_once() {
        struct Noop;
        impl std::task::Wake for Noop {
            fn wake(self: std::sync::Arc<Self>) {}
        }

        let (p, r) = promise::<u8>();
        let waker = Waker::from(std::sync::Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        assert!(p.poll_settled(&mut cx).is_pending());
        r.resolve(7);
        assert_eq!(p.poll_settled(&mut cx), Poll::Ready(Ok(7)));
        assert!(matches!(p.poll_settled(&mut cx), Poll::Ready(Err(_))));
    }

    #[test]
    fn test_repolling_replaces_parked_waker() {
        struct Flag(std::sync::atomic::AtomicBool);
        impl std::task::Wake for Flag {
            fn wake(self: std::sync::Arc<Self>) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let (p, r) = promise::<u8>();
        let mut last = None;
        for _ in 0..100 {
            let flag = std::sync::Arc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
            let waker = Waker::from(flag.clone());
            assert!(p.poll_settled(&mut Context::from_waker(&waker)).is_pending());
            last = Some(flag);
        }
        assert_eq!(r.parked_wakers(), 1);

        r.resolve(1);
        assert_eq!(r.parked_wakers(), 0);
        let woken = last.map(|f| f.0.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(woken, Some(true));
    }
}
