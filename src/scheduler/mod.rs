//! Cooperative async test scheduler
//!
//! Runs test bodies that suspend on timers, condition polls, promises or
//! groups of sub-operations. Exactly one task is polled at a time on the
//! calling thread; a task only gives up control at an explicit suspension
//! point (`sleep`, `wait_until`, `await_promise`, `parallel`, `yield_now`).
//!
//! Time comes from a [`ClockMode`]. The default virtual clock never sleeps:
//! when nothing is ready the scheduler jumps straight to the earliest timer
//! or task deadline, so runs are fast and their interleavings reproducible.
//! Timers due at the same instant fire in registration order.
//!
//! ```
//! use specula::scheduler::Scheduler;
//! use std::time::Duration;
//!
//! let mut sched = Scheduler::new();
//! let ctx = sched.context();
//! let outcome = sched.block_on("slow", async move {
//!     ctx.sleep(1_000).await;
//!     Ok(())
//! }, Some(Duration::from_millis(50)));
//! assert!(outcome.is_timed_out());
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result, TestError};

mod context;
mod promise;

pub use context::{Parallel, PromiseWait, Sleep, TestContext, YieldNow};
pub use promise::{promise, Promise, Resolver};

/// Boxed, non-`Send` future. Test bodies share `Rc` state freely.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// What a test body or hook eventually produces.
pub type TaskResult = std::result::Result<(), TestError>;

// ---------------------------------------------------------------------------
// Identifiers and states
// ---------------------------------------------------------------------------

/// Unique identifier for a task within a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Source of time for timers and deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Jump to the next event instead of sleeping.
    Virtual,
    /// Real time; idle periods block the thread.
    Wall,
}

/// Why a task is parked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// Waiting for the clock to reach `resume_at` (ms).
    Timer { resume_at: u64 },
    /// Between two `wait_until` predicate polls.
    Condition { next_poll_at: u64 },
    /// Waiting for a promise to settle.
    Promise,
    /// Waiting for `pending` sub-operations of a `parallel` group.
    Parallel { pending: usize },
    /// Voluntarily yielded; already re-queued.
    Yield,
    /// Waiting on something outside the scheduler's primitives.
    External,
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The future returned (panics are converted into `Err` values).
    Returned(TaskResult),
    /// The deadline passed first; the continuation was abandoned.
    TimedOut { elapsed_ms: u64 },
    /// Nothing could ever wake the task again.
    Stalled,
}

impl TaskOutcome {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, TaskOutcome::TimedOut { .. })
    }
}

/// Lifecycle state of a task: `Ready → Suspended ⇄ Ready → Completed`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Ready,
    Suspended(SuspendReason),
    Completed(TaskOutcome),
}

// ---------------------------------------------------------------------------
// SchedulerConfig / SchedulerStats
// ---------------------------------------------------------------------------

/// Configuration for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub clock: ClockMode,
    /// Default `wait_until` poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// A task polled this many times without finishing is declared stalled.
    /// Guards against futures that wake themselves forever under the
    /// virtual clock, where time never moves while work is ready.
    pub max_polls_per_task: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::Virtual,
            poll_interval_ms: 10,
            max_polls_per_task: 1_000_000,
        }
    }
}

/// Runtime statistics for the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    pub tasks_timed_out: u64,
    pub tasks_panicked: u64,
    pub tasks_stalled: u64,
    pub total_polls: u64,
    pub timers_fired: u64,
    pub clock_advances: u64,
}

// ---------------------------------------------------------------------------
// Clock and shared core
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Clock {
    mode: ClockMode,
    virtual_ms: u64,
    origin: Instant,
}

impl Clock {
    fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            virtual_ms: 0,
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        match self.mode {
            ClockMode::Virtual => self.virtual_ms,
            ClockMode::Wall => self.origin.elapsed().as_millis() as u64,
        }
    }

    fn advance_to(&mut self, target: u64) {
        match self.mode {
            ClockMode::Virtual => self.virtual_ms = self.virtual_ms.max(target),
            ClockMode::Wall => {
                let now = self.now_ms();
                if target > now {
                    std::thread::sleep(Duration::from_millis(target - now));
                }
            }
        }
    }
}

/// Timer key: `(deadline_ms, registration sequence)`. The sequence keeps
/// timers with equal deadlines in registration order.
pub(crate) type TimerKey = (u64, u64);

/// State shared between the scheduler and every [`TestContext`].
#[derive(Debug)]
pub(crate) struct Core {
    clock: Clock,
    timers: BTreeMap<TimerKey, Waker>,
    next_timer_seq: u64,
    current: Option<TaskId>,
    pending_reason: Option<SuspendReason>,
    poll_interval_ms: u64,
}

impl Core {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            clock: Clock::new(config.clock),
            timers: BTreeMap::new(),
            next_timer_seq: 0,
            current: None,
            pending_reason: None,
            poll_interval_ms: config.poll_interval_ms,
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub(crate) fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub(crate) fn register_timer(&mut self, deadline: u64, waker: &Waker) -> TimerKey {
        let key = (deadline, self.next_timer_seq);
        self.next_timer_seq += 1;
        self.timers.insert(key, waker.clone());
        key
    }

    /// Refresh the waker of a still-armed timer. Returns `false` once the
    /// timer has fired.
    pub(crate) fn update_timer(&mut self, key: TimerKey, waker: &Waker) -> bool {
        match self.timers.get_mut(&key) {
            Some(existing) => {
                if !existing.will_wake(waker) {
                    *existing = waker.clone();
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_timer(&mut self, key: TimerKey) {
        self.timers.remove(&key);
    }

    /// Record why the task currently being polled is about to return
    /// `Pending`. The outermost primitive writes last and wins.
    pub(crate) fn note_suspend(&mut self, reason: SuspendReason) {
        if self.current.is_some() {
            self.pending_reason = Some(reason);
        }
    }

    fn next_timer(&self) -> Option<u64> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    fn take_due(&mut self, now: u64) -> Vec<Waker> {
        let later = self.timers.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut self.timers, later);
        due.into_values().collect()
    }
}

// ---------------------------------------------------------------------------
// Waker
// ---------------------------------------------------------------------------

type WakeQueue = Arc<Mutex<VecDeque<TaskId>>>;

fn lock_queue(queue: &WakeQueue) -> MutexGuard<'_, VecDeque<TaskId>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TaskWaker {
    id: TaskId,
    queue: WakeQueue,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut queue = lock_queue(&self.queue);
        if !queue.contains(&self.id) {
            queue.push_back(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerTask
// ---------------------------------------------------------------------------

/// One in-flight test-body (or hook) execution.
pub struct SchedulerTask {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Clock reading when the task was spawned.
    pub started_at_ms: u64,
    /// Absolute deadline (`started_at_ms + timeout`), if any.
    pub deadline_ms: Option<u64>,
    pub poll_count: u64,
    future: Option<LocalBoxFuture<'static, TaskResult>>,
    /// Built once so leaf futures can recognise it across polls.
    waker: Waker,
}

impl std::fmt::Debug for SchedulerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("deadline_ms", &self.deadline_ms)
            .field("poll_count", &self.poll_count)
            .finish()
    }
}

impl SchedulerTask {
    pub fn is_finished(&self) -> bool {
        matches!(self.state, TaskState::Completed(_))
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Single-threaded cooperative executor for test tasks.
pub struct Scheduler {
    core: Rc<RefCell<Core>>,
    wake_queue: WakeQueue,
    tasks: HashMap<TaskId, SchedulerTask>,
    next_id: u64,
    pub config: SchedulerConfig,
    pub stats: SchedulerStats,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.len())
            .field("now_ms", &self.now_ms())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a scheduler with a virtual clock.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            core: Rc::new(RefCell::new(Core::new(&config))),
            wake_queue: Arc::new(Mutex::new(VecDeque::new())),
            tasks: HashMap::default(),
            next_id: 0,
            config,
            stats: SchedulerStats::default(),
        }
    }

    /// Handle through which task bodies reach the suspension primitives.
    pub fn context(&self) -> TestContext {
        TestContext::new(self.core.clone())
    }

    /// Current clock reading in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.core.borrow().now_ms()
    }

    // -- Spawning ----------------------------------------------------------

    /// Register a task. It is polled for the first time by the next
    /// [`step`](Scheduler::step).
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F, timeout: Option<Duration>) -> TaskId
    where
        F: Future<Output = TaskResult> + 'static,
    {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        let started_at_ms = self.now_ms();
        let deadline_ms = timeout.map(|t| started_at_ms.saturating_add(t.as_millis() as u64));
        let name = name.into();
        trace!(task = %id, name = %name, ?deadline_ms, "task spawned");

        self.tasks.insert(
            id,
            SchedulerTask {
                id,
                name,
                state: TaskState::Ready,
                started_at_ms,
                deadline_ms,
                poll_count: 0,
                future: Some(Box::pin(future)),
                waker: Waker::from(Arc::new(TaskWaker {
                    id,
                    queue: self.wake_queue.clone(),
                })),
            },
        );
        lock_queue(&self.wake_queue).push_back(id);
        self.stats.tasks_spawned += 1;
        id
    }

    /// Spawn a task, drive it to completion and consume its outcome.
    pub fn block_on<F>(&mut self, name: impl Into<String>, future: F, timeout: Option<Duration>) -> TaskOutcome
    where
        F: Future<Output = TaskResult> + 'static,
    {
        let id = self.spawn(name, future, timeout);
        match self.run_until_complete(id) {
            Ok(outcome) => {
                self.tasks.remove(&id);
                outcome
            }
            // The id was inserted just above.
            Err(_) => TaskOutcome::Stalled,
        }
    }

    // -- Execution ---------------------------------------------------------

    /// Poll the next ready task, if any. Returns `false` when nothing is ready.
    pub fn step(&mut self) -> bool {
        let next = lock_queue(&self.wake_queue).pop_front();
        match next {
            Some(id) => {
                self.poll_task(id);
                true
            }
            None => false,
        }
    }

    fn poll_task(&mut self, id: TaskId) {
        let (mut future, waker) = match self.tasks.get_mut(&id) {
            Some(task) if !task.is_finished() => match task.future.take() {
                Some(f) => (f, task.waker.clone()),
                None => return,
            },
            _ => return,
        };

        {
            let mut core = self.core.borrow_mut();
            core.current = Some(id);
            core.pending_reason = None;
        }

        let mut cx = Context::from_waker(&waker);
        let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        let reason = {
            let mut core = self.core.borrow_mut();
            core.current = None;
            core.pending_reason.take()
        };
        self.stats.total_polls += 1;

        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.poll_count += 1;

        match polled {
            Ok(Poll::Ready(result)) => {
                trace!(task = %id, ok = result.is_ok(), "task completed");
                task.state = TaskState::Completed(TaskOutcome::Returned(result));
                self.stats.tasks_completed += 1;
            }
            Ok(Poll::Pending) if task.poll_count >= self.config.max_polls_per_task => {
                trace!(task = %id, polls = task.poll_count, "task exceeded poll budget");
                task.state = TaskState::Completed(TaskOutcome::Stalled);
                self.stats.tasks_stalled += 1;
            }
            Ok(Poll::Pending) => {
                let reason = reason.unwrap_or(SuspendReason::External);
                trace!(task = %id, ?reason, "task suspended");
                task.state = TaskState::Suspended(reason);
                task.future = Some(future);
            }
            Err(payload) => {
                let err = TestError::from_panic(payload);
                trace!(task = %id, error = %err, "task panicked");
                task.state = TaskState::Completed(TaskOutcome::Returned(Err(err)));
                self.stats.tasks_panicked += 1;
            }
        }
    }

    /// Move time forward to the next event when nothing is ready.
    ///
    /// Timers due at the new instant are fired first; only if none fired are
    /// overdue tasks expired, so a timer landing exactly on a deadline still
    /// gets to run. Returns `false` if there is no future event at all.
    pub fn advance(&mut self) -> bool {
        let now = self.now_ms();
        let next_timer = self.core.borrow().next_timer();
        let next_deadline = self
            .tasks
            .values()
            .filter(|t| !t.is_finished())
            .filter_map(|t| t.deadline_ms)
            .min();

        let target = match (next_timer, next_deadline) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return false,
        };

        if target > now {
            self.core.borrow_mut().clock.advance_to(target);
            self.stats.clock_advances += 1;
            trace!(from = now, to = target, "clock advanced");
        }

        let now = self.now_ms();
        let due = self.core.borrow_mut().take_due(now);
        if !due.is_empty() {
            self.stats.timers_fired += due.len() as u64;
            for waker in due {
                waker.wake();
            }
            return true;
        }

        self.expire_overdue(now, false) > 0
    }

    /// Abandon every live task whose deadline has been reached. With
    /// `strict`, a task expires only once the clock is past its deadline.
    fn expire_overdue(&mut self, now: u64, strict: bool) -> usize {
        let mut overdue: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| !t.is_finished())
            .filter(|t| match t.deadline_ms {
                Some(d) if strict => now > d,
                Some(d) => now >= d,
                None => false,
            })
            .map(|t| t.id)
            .collect();
        overdue.sort();

        let mut abandoned = Vec::with_capacity(overdue.len());
        for id in &overdue {
            if let Some(task) = self.tasks.get_mut(id) {
                let elapsed_ms = now.saturating_sub(task.started_at_ms);
                trace!(task = %id, elapsed_ms, "task timed out");
                task.state = TaskState::Completed(TaskOutcome::TimedOut { elapsed_ms });
                abandoned.push(task.future.take());
                self.stats.tasks_timed_out += 1;
            }
        }
        // Dropping the continuations disarms their timers.
        drop(abandoned);
        overdue.len()
    }

    fn stall(&mut self, id: TaskId) {
        let future = match self.tasks.get_mut(&id) {
            Some(task) if !task.is_finished() => {
                trace!(task = %id, "task stalled");
                task.state = TaskState::Completed(TaskOutcome::Stalled);
                self.stats.tasks_stalled += 1;
                task.future.take()
            }
            _ => None,
        };
        drop(future);
    }

    /// Drive the scheduler until task `id` completes.
    ///
    /// Other live tasks make progress in the meantime.
    pub fn run_until_complete(&mut self, id: TaskId) -> Result<TaskOutcome> {
        if !self.tasks.contains_key(&id) {
            return Err(Error::Scheduler(format!("{} not found", id)));
        }
        loop {
            if self.config.clock == ClockMode::Wall {
                let now = self.now_ms();
                self.expire_overdue(now, true);
            }
            if let Some(TaskState::Completed(outcome)) = self.tasks.get(&id).map(|t| &t.state) {
                return Ok(outcome.clone());
            }
            if self.step() || self.advance() {
                continue;
            }
            self.stall(id);
        }
    }

    /// Drive every live task to completion.
    pub fn run_all(&mut self) {
        loop {
            if self.config.clock == ClockMode::Wall {
                let now = self.now_ms();
                self.expire_overdue(now, true);
            }
            if self.step() || self.advance() {
                continue;
            }
            let mut stuck: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|t| !t.is_finished())
                .map(|t| t.id)
                .collect();
            stuck.sort();
            for id in stuck {
                self.stall(id);
            }
            return;
        }
    }

    /// Remove a completed task and hand back its outcome.
    pub fn take_outcome(&mut self, id: TaskId) -> Option<TaskOutcome> {
        match self.tasks.get(&id).map(|t| &t.state) {
            Some(TaskState::Completed(_)) => match self.tasks.remove(&id) {
                Some(SchedulerTask {
                    state: TaskState::Completed(outcome),
                    ..
                }) => Some(outcome),
                _ => None,
            },
            _ => None,
        }
    }

    // -- Queries -----------------------------------------------------------

    pub fn get(&self, id: TaskId) -> Option<&SchedulerTask> {
        self.tasks.get(&id)
    }

    /// Number of tasks not yet completed.
    pub fn live_tasks(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
