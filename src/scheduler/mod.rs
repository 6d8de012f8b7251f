use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::warn;

use crate::clock::ClockRef;
use crate::error::FluxError;

pub use self::event_loop::EventLoopScheduler;
pub use self::immediate::ImmediateScheduler;
pub use self::virtual_time::VirtualTimeScheduler;

/// A scheduler running every task synchronously on the calling thread.
pub mod immediate;

/// Schedulers backed by event-loop threads: *single* (one loop) and *parallel* (n loops).
pub mod event_loop;

/// A scheduler driven by a virtual clock, for deterministic tests of time-based operators.
pub mod virtual_time;


///////////////////////////////////////////////////////////////////////////////////////////////////
// TASKS
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A unit of work submitted to a `Worker`.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A handle on a scheduled task, allowing to cancel it before it starts.
#[derive(Clone, Debug, Default)]
pub struct TaskHandle {
  cancelled: Arc<AtomicBool>
}

impl TaskHandle {
  /// Creates a handle for a task that has not been cancelled.
  pub fn new() -> Self {
    Self::default()
  }

  /// Cancels the task. Idempotent; has no effect on a task that already started.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
  }

  /// Whether `cancel` was called on this handle.
  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SCHEDULER & WORKER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// One logical thread of control: tasks scheduled on a worker run one at a time, in due-time
/// order, ties being broken by submission order.
pub trait Worker: Send + Sync + 'static {
  /// Schedules `task` to run once `delay` has elapsed on the scheduler's clock.
  fn schedule(&self, task: Task, delay: Duration) -> Result<TaskHandle, FluxError>;

  /// Cancels every task of this worker that has not started yet, and rejects new ones.
  fn dispose(&self);

  /// Whether `dispose` was called.
  fn is_disposed(&self) -> bool;
}

/// A shared worker reference.
pub type WorkerRef = Arc<dyn Worker>;

/// An execution context handing out `Worker`s.
pub trait Scheduler: Send + Sync + 'static {
  /// Creates a new worker. Tasks of distinct workers may run in parallel.
  fn create_worker(&self) -> WorkerRef;

  /// The clock tasks of this scheduler are timed against.
  fn clock(&self) -> ClockRef;

  /// A short human-readable name, used in logs and errors.
  fn name(&self) -> &'static str;

  /// Current time of the scheduler's clock.
  fn now(&self) -> Duration {
    self.clock().now()
  }
}

/// A shared scheduler reference.
pub type SchedulerRef = Arc<dyn Scheduler>;


///////////////////////////////////////////////////////////////////////////////////////////////////
// CONFIGURATION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Environment variable overriding the size of the default parallel scheduler.
pub const PARALLELISM_ENV: &str = "FLUXRUST_PARALLELISM";

/// Settings used to build the process-wide schedulers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
  /// Number of event loops of the default parallel scheduler.
  pub parallelism: NonZeroUsize
}

impl SchedulerConfig {
  /// Reads `FLUXRUST_PARALLELISM`, falling back to the available parallelism of the host.
  pub fn from_env() -> Self {
    let fallback = Self::default();

    match std::env::var(PARALLELISM_ENV) {
      Ok(raw) => match raw.trim().parse::<NonZeroUsize>() {
        Ok(parallelism) => SchedulerConfig { parallelism },
        Err(_) => {
          warn!(variable = PARALLELISM_ENV, value = %raw, "ignoring invalid parallelism");
          fallback
        }
      },
      Err(_) => fallback
    }
  }
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    let parallelism = std::thread::available_parallelism()
      .unwrap_or(NonZeroUsize::MIN);
    SchedulerConfig { parallelism }
  }
}

/// The kinds of schedulers `create` can build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerKind {
  /// Runs tasks synchronously on the caller.
  Immediate,
  /// One serializing event loop.
  Single,
  /// `n` independent event loops.
  Parallel(NonZeroUsize),
}

/// Builds a fresh scheduler of the given kind.
pub fn create(kind: SchedulerKind) -> SchedulerRef {
  match kind {
    SchedulerKind::Immediate        => Arc::new(ImmediateScheduler::new()),
    SchedulerKind::Single           => Arc::new(EventLoopScheduler::single("single")),
    SchedulerKind::Parallel(loops)  => Arc::new(EventLoopScheduler::parallel("parallel", loops.get())),
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// DEFAULT SCHEDULERS
///////////////////////////////////////////////////////////////////////////////////////////////////

static PARALLEL: OnceLock<SchedulerRef> = OnceLock::new();
static SINGLE: OnceLock<SchedulerRef> = OnceLock::new();

thread_local! {
  static TIMER_OVERRIDE: RefCell<Vec<SchedulerRef>> = const { RefCell::new(Vec::new()) };
}

/// The process-wide parallel scheduler, sized by `SchedulerConfig::from_env`.
pub fn parallel() -> SchedulerRef {
  PARALLEL.get_or_init(|| {
    let config = SchedulerConfig::from_env();
    Arc::new(EventLoopScheduler::parallel("parallel", config.parallelism.get()))
  }).clone()
}

/// The process-wide single-loop scheduler.
pub fn single() -> SchedulerRef {
  SINGLE.get_or_init(|| Arc::new(EventLoopScheduler::single("single"))).clone()
}

/// The immediate scheduler.
pub fn immediate() -> SchedulerRef {
  Arc::new(ImmediateScheduler::new())
}

/// The scheduler used by time-based operators built without an explicit scheduler.
///
/// This is the process-wide parallel scheduler, unless `with_default_timer` is running
/// on the current thread.
pub fn default_timer() -> SchedulerRef {
  TIMER_OVERRIDE
    .with(|stack| stack.borrow().last().cloned())
    .unwrap_or_else(parallel)
}

/// Runs `assemble` with `scheduler` as the `default_timer` of the current thread.
///
/// Operators resolve their scheduler when they are built, so only pipelines assembled
/// inside `assemble` are affected.
pub fn with_default_timer<R>(scheduler: SchedulerRef, assemble: impl FnOnce() -> R) -> R {
  struct Restore;

  impl Drop for Restore {
    fn drop(&mut self) {
      TIMER_OVERRIDE.with(|stack| stack.borrow_mut().pop());
    }
  }

  TIMER_OVERRIDE.with(|stack| stack.borrow_mut().push(scheduler));
  let _restore = Restore;
  assemble()
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
