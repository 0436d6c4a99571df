//! Suspension primitives available to async test bodies

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use super::promise::Promise;
use super::{Core, SuspendReason, TaskId, TimerKey};
use crate::error::TestError;

/// Handle given to async tests and hooks.
///
/// Cloning is cheap; every clone talks to the same scheduler.
#[derive(Clone)]
pub struct TestContext {
    core: Rc<RefCell<Core>>,
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("now_ms", &self.now_ms())
            .field("task", &self.current_task())
            .finish()
    }
}

impl TestContext {
    pub(crate) fn new(core: Rc<RefCell<Core>>) -> Self {
        Self { core }
    }

    /// Current scheduler clock reading in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.core.borrow().now_ms()
    }

    /// Task currently being polled, if called from inside one.
    pub fn current_task(&self) -> Option<TaskId> {
        self.core.borrow().current()
    }

    /// Suspend for `ms` milliseconds of scheduler time.
    pub fn sleep(&self, ms: u64) -> Sleep {
        let deadline = self.now_ms().saturating_add(ms);
        Sleep::until(
            self.core.clone(),
            deadline,
            SuspendReason::Timer { resume_at: deadline },
        )
    }

    /// Give other ready tasks a turn without moving the clock.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow {
            core: self.core.clone(),
            yielded: false,
        }
    }

    /// Suspend until `promise` settles.
    pub fn await_promise<T>(&self, promise: Promise<T>) -> PromiseWait<T> {
        PromiseWait {
            core: self.core.clone(),
            promise,
        }
    }

    /// Poll `predicate` until it holds or `timeout_ms` elapses.
    ///
    /// The predicate is checked immediately, then once per `poll_interval_ms`
    /// (the scheduler default when `None`) and a final time at the deadline.
    /// Every wait between checks suspends the calling task. Returns whether
    /// the predicate was observed true.
    pub async fn wait_until<P>(&self, mut predicate: P, timeout_ms: u64, poll_interval_ms: Option<u64>) -> bool
    where
        P: FnMut() -> bool,
    {
        let interval = poll_interval_ms
            .unwrap_or_else(|| self.core.borrow().poll_interval_ms())
            .max(1);
        let deadline = self.now_ms().saturating_add(timeout_ms);
        loop {
            if predicate() {
                return true;
            }
            let now = self.now_ms();
            if now >= deadline {
                return false;
            }
            let next = now.saturating_add(interval).min(deadline);
            Sleep::until(
                self.core.clone(),
                next,
                SuspendReason::Condition { next_poll_at: next },
            )
            .await;
        }
    }

    /// Run sub-operations concurrently within the current task.
    ///
    /// Resolves once every operation has finished, with results in input
    /// order regardless of completion order.
    pub fn parallel<I, F>(&self, ops: I) -> Parallel<F>
    where
        I: IntoIterator<Item = F>,
        F: Future,
    {
        Parallel {
            core: self.core.clone(),
            slots: ops.into_iter().map(|f| Slot::Running(Box::pin(f))).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sleep
// ---------------------------------------------------------------------------

/// Future returned by [`TestContext::sleep`].
pub struct Sleep {
    core: Rc<RefCell<Core>>,
    deadline: u64,
    key: Option<TimerKey>,
    reason: SuspendReason,
}

impl Sleep {
    pub(crate) fn until(core: Rc<RefCell<Core>>, deadline: u64, reason: SuspendReason) -> Self {
        Self {
            core,
            deadline,
            key: None,
            reason,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut core = this.core.borrow_mut();
        if core.now_ms() >= this.deadline {
            if let Some(key) = this.key.take() {
                core.cancel_timer(key);
            }
            return Poll::Ready(());
        }
        match this.key {
            Some(key) if core.update_timer(key, cx.waker()) => {}
            _ => this.key = Some(core.register_timer(this.deadline, cx.waker())),
        }
        core.note_suspend(this.reason.clone());
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Ok(mut core) = self.core.try_borrow_mut() {
                core.cancel_timer(key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// YieldNow
// ---------------------------------------------------------------------------

/// Future returned by [`TestContext::yield_now`].
pub struct YieldNow {
    core: Rc<RefCell<Core>>,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.yielded = true;
        cx.waker().wake_by_ref();
        this.core.borrow_mut().note_suspend(SuspendReason::Yield);
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// PromiseWait
// ---------------------------------------------------------------------------

/// Future returned by [`TestContext::await_promise`].
pub struct PromiseWait<T> {
    core: Rc<RefCell<Core>>,
    promise: Promise<T>,
}

impl<T> Unpin for PromiseWait<T> {}

impl<T> Future for PromiseWait<T> {
    type Output = Result<T, TestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.promise.poll_settled(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                this.core.borrow_mut().note_suspend(SuspendReason::Promise);
                Poll::Pending
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

enum Slot<F: Future> {
    Running(Pin<Box<F>>),
    Done(Option<F::Output>),
}

/// Future returned by [`TestContext::parallel`].
pub struct Parallel<F: Future> {
    core: Rc<RefCell<Core>>,
    slots: Vec<Slot<F>>,
}

impl<F: Future> Unpin for Parallel<F> {}

impl<F: Future> Parallel<F> {
    /// Number of sub-operations still running.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Running(_)))
            .count()
    }
}

impl<F: Future> Future for Parallel<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut pending = 0;
        for slot in this.slots.iter_mut() {
            let finished = match slot {
                Slot::Running(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(value) => Some(value),
                    Poll::Pending => None,
                },
                Slot::Done(_) => continue,
            };
            match finished {
                Some(value) => *slot = Slot::Done(Some(value)),
                None => pending += 1,
            }
        }

        if pending > 0 {
            this.core
                .borrow_mut()
                .note_suspend(SuspendReason::Parallel { pending });
            return Poll::Pending;
        }

        let results = this
            .slots
            .iter_mut()
            .filter_map(|slot| match slot {
                Slot::Done(value) => value.take(),
                Slot::Running(_) => None,
            })
            .collect();
        Poll::Ready(results)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{promise, Scheduler, TaskOutcome, TaskState};
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn test_wait_until_polls_until_true() {
        let mut sched = Scheduler::new();
        let ctx = sched.context();
        let checks = Rc::new(Cell::new(0u32));
        let counter = checks.clone();
        let seen = Rc::new(Cell::new(false));
        let seen_in = seen.clone();
        let outcome = sched.block_on(
            "poll",
            async move {
                let clock = ctx.clone();
                let ok = ctx
                    .wait_until(
                        move || {
                            counter.set(counter.get() + 1);
                            clock.now_ms() >= 30
                        },
                        1_000,
                        Some(10),
                    )
                    .await;
                seen_in.set(ok);
                Ok(())
            },
            None,
        );
        assert_eq!(outcome, TaskOutcome::Returned(Ok(())));
        assert!(seen.get());
        // Checked at t=0, 10, 20, 30.
        assert_eq!(checks.get(), 4);
        assert_eq!(sched.now_ms(), 30);
    }

    #[test]
    fn test_wait_until_gives_up_at_timeout() {
        let mut sched = Scheduler::new();
        let ctx = sched.context();
        let result = Rc::new(Cell::new(true));
        let out = result.clone();
        sched.block_on(
            "never",
            async move {
                out.set(ctx.wait_until(|| false, 25, Some(10)).await);
                Ok(())
            },
            None,
        );
        assert!(!result.get());
        // Final check lands exactly on the deadline.
        assert_eq!(sched.now_ms(), 25);
    }

    #[test]
    fn test_wait_until_reports_condition_reason() {
        let mut sched = Scheduler::new();
        let ctx = sched.context();
        let id = sched.spawn(
            "cond",
            async move {
                ctx.wait_until(|| false, 100, None).await;
                Ok(())
            },
            None,
        );
        sched.step();
        assert_eq!(
            sched.get(id).map(|t| t.state.clone()),
            Some(TaskState::Suspended(SuspendReason::Condition { next_poll_at: 10 }))
        );
    }

    #[test]
    fn test_parallel_keeps_input_order() {
        let mut sched = Scheduler::new();
        let ctx = sched.context();
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        let outcome = sched.block_on(
            "fan-out",
            async move {
                let ops = [30u64, 10, 20].into_iter().map(|delay| {
                    let ctx = ctx.clone();
                    async move {
                        ctx.sleep(delay).await;
                        (delay, ctx.now_ms())
                    }
                });
                let out = ctx.parallel(ops).await;
                sink.borrow_mut().extend(out);
                Ok(())
            },
            Some(Duration::from_millis(1_000)),
        );
        assert_eq!(outcome, TaskOutcome::Returned(Ok(())));
        assert_eq!(*results.borrow(), vec![(30, 30), (10, 10), (20, 20)]);
        // Sub-operations overlapped instead of running back to back.
        assert_eq!(sched.now_ms(), 30);
    }

    #[test]
    fn test_parallel_of_nothing_is_ready() {
        let mut sched = Scheduler::new();
        let ctx = sched.context();
        let outcome = sched.block_on(
            "empty",
            async move {
                let out: Vec<()> = ctx.parallel(Vec::<std::future::Ready<()>>::new()).await;
                assert!(out.is_empty());
                Ok(())
            },
            None,
        );
        assert_eq!(outcome, TaskOutcome::Returned(Ok(())));
        assert_eq!(sched.stats.total_polls, 1);
    }

    #[test]
    fn test_promise_resolved_from_another_task() {
        let mut sched = Scheduler::new();
        let (p, resolver) = promise::<&'static str>();
        let producer_ctx = sched.context();
        sched.spawn(
            "producer",
            async move {
                producer_ctx.sleep(15).await;
                resolver.resolve("ready");
                Ok(())
            },
            None,
        );
        let ctx = sched.context();
        let got = Rc::new(RefCell::new(None));
        let sink = got.clone();
        let outcome = sched.block_on(
            "consumer",
            async move {
                let value = ctx.await_promise(p).await?;
                *sink.borrow_mut() = Some((value, ctx.now_ms()));
                Ok(())
            },
            None,
        );
        assert_eq!(outcome, TaskOutcome::Returned(Ok(())));
        assert_eq!(*got.borrow(), Some(("ready", 15)));
    }

    #[test]
    fn test_promise_in_parallel_parks_one_waker() {
        type Op = Pin<Box<dyn Future<Output = Result<(), TestError>>>>;

        let mut sched = Scheduler::new();
        let (p, resolver) = promise::<()>();
        let ctx = sched.context();
        let id = sched.spawn(
            "mixed",
            async move {
                let spinner = ctx.clone();
                let ops: Vec<Op> = vec![
                    Box::pin(ctx.await_promise(p)),
                    Box::pin(async move {
                        for _ in 0..1_000 {
                            spinner.yield_now().await;
                        }
                        Ok(())
                    }),
                ];
                for result in ctx.parallel(ops).await {
                    result?;
                }
                Ok(())
            },
            None,
        );

        for _ in 0..1_001 {
            sched.step();
        }
        assert_eq!(resolver.parked_wakers(), 1);
        assert!(resolver.resolve(()));
        assert_eq!(sched.run_until_complete(id).unwrap(), TaskOutcome::Returned(Ok(())));
    }

    #[test]
    fn test_rejected_promise_surfaces_error() {
        let mut sched = Scheduler::new();
        let ctx = sched.context();
        let outcome = sched.block_on(
            "rejected",
            async move {
                ctx.await_promise(Promise::<()>::rejected(TestError::raised("refused")))
                    .await?;
                Ok(())
            },
            None,
        );
        assert_eq!(
            outcome,
            TaskOutcome::Returned(Err(TestError::raised("refused")))
        );
    }
}
