use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::{Clock, ClockRef, VirtualClock};
use crate::error::FluxError;
use crate::scheduler::{Scheduler, Task, TaskHandle, Worker, WorkerRef};


///////////////////////////////////////////////////////////////////////////////////////////////////
// VIRTUAL TASK QUEUE
///////////////////////////////////////////////////////////////////////////////////////////////////

struct VirtualTask {
  due     : Duration,
  sequence: u64,
  task    : Task,
  handle  : TaskHandle,
  disposed: Arc<AtomicBool>
}

impl VirtualTask {
  fn is_cancelled(&self) -> bool {
    self.handle.is_cancelled() || self.disposed.load(Ordering::Acquire)
  }
}

impl PartialEq for VirtualTask {
  fn eq(&self, other: &Self) -> bool {
    self.due == other.due && self.sequence == other.sequence
  }
}

impl Eq for VirtualTask {}

impl Ord for VirtualTask {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    // Min-heap: earliest due time first, then lowest sequence
    other.due.cmp(&self.due).then_with(|| other.sequence.cmp(&self.sequence))
  }
}

impl PartialOrd for VirtualTask {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

struct VirtualState {
  clock   : Arc<VirtualClock>,
  queue   : Mutex<BinaryHeap<VirtualTask>>,
  sequence: AtomicU64,
  draining: AtomicBool
}

impl VirtualState {
  /// Pops the earliest live task due at or before `limit`.
  fn pop_due(&self, limit: Duration) -> Option<VirtualTask> {
    let mut queue = self.queue.lock();
    loop {
      match queue.peek() {
        Some(next) if next.due <= limit => {
          let task = queue.pop()?;
          if !task.is_cancelled() {
            return Some(task);
          }
        },
        _ => return None
      }
    }
  }

  /// Runs tasks due at or before `limit`, moving the clock to each task's due time.
  /// Returns the number of tasks run; does nothing when a drain is already in progress.
  fn drain_until(&self, limit: Duration) -> usize {
    struct Release<'a>(&'a AtomicBool);

    impl Drop for Release<'_> {
      fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
      }
    }

    if self.draining.swap(true, Ordering::AcqRel) {
      return 0;
    }
    let _release = Release(&self.draining);

    let mut ran = 0;
    while let Some(next) = self.pop_due(limit) {
      self.clock.set(next.due);
      (next.task)();
      ran += 1;
    }
    ran
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// VIRTUAL TIME SCHEDULER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A scheduler whose clock only advances on explicit calls.
///
/// All workers share one queue, and every task runs on the thread that advances time (or,
/// for tasks due right now, on the thread that scheduled them). Runs are thus deterministic:
/// tasks execute in due-time order, ties broken by submission order.
#[derive(Clone)]
pub struct VirtualTimeScheduler {
  state: Arc<VirtualState>
}

impl VirtualTimeScheduler {
  /// Creates a virtual-time scheduler at time zero.
  pub fn new() -> Self {
    VirtualTimeScheduler {
      state: Arc::new(VirtualState {
        clock   : Arc::new(VirtualClock::new()),
        queue   : Mutex::new(BinaryHeap::new()),
        sequence: AtomicU64::new(0),
        draining: AtomicBool::new(false)
      })
    }
  }

  /// Runs every task due within `delta` from now, then sets the clock to now + `delta`.
  pub fn advance_time_by(&self, delta: Duration) {
    let target = self.state.clock.now() + delta;
    self.advance_time_to(target);
  }

  /// Runs every task due at or before `target`, then sets the clock to `target`.
  pub fn advance_time_to(&self, target: Duration) {
    let ran = self.state.drain_until(target);
    self.state.clock.set(target);
    trace!(now = ?self.state.clock.now(), ran, pending = self.pending_tasks(), "advanced virtual time");
  }

  /// Moves the clock to the earliest pending task and runs every task due at that time.
  /// Returns `false` when no task was pending.
  pub fn advance_to_next(&self) -> bool {
    let next_due = {
      let mut queue = self.state.queue.lock();
      while queue.peek().map_or(false, VirtualTask::is_cancelled) {
        queue.pop();
      }
      queue.peek().map(|task| task.due)
    };

    match next_due {
      Some(due) => {
        self.advance_time_to(due.max(self.state.clock.now()));
        true
      },
      None => false
    }
  }

  /// Number of tasks waiting in the queue (cancelled ones included until they are popped).
  pub fn pending_tasks(&self) -> usize {
    self.state.queue.lock().len()
  }
}

impl Default for VirtualTimeScheduler {
  fn default() -> Self {
    Self::new()
  }
}

impl Scheduler for VirtualTimeScheduler {
  fn create_worker(&self) -> WorkerRef {
    Arc::new(VirtualWorker {
      state   : self.state.clone(),
      disposed: Arc::new(AtomicBool::new(false))
    })
  }

  fn clock(&self) -> ClockRef {
    self.state.clock.clone()
  }

  fn name(&self) -> &'static str {
    "virtual-time"
  }
}


struct VirtualWorker {
  state   : Arc<VirtualState>,
  disposed: Arc<AtomicBool>
}

impl Worker for VirtualWorker {
  fn schedule(&self, task: Task, delay: Duration) -> Result<TaskHandle, FluxError> {
    if self.is_disposed() {
      return Err(FluxError::Rejected { scheduler: "virtual-time", reason: "worker disposed".into() });
    }

    let handle = TaskHandle::new();
    let now = self.state.clock.now();
    self.state.queue.lock().push(VirtualTask {
      due     : now + delay,
      sequence: self.state.sequence.fetch_add(1, Ordering::Relaxed),
      task,
      handle  : handle.clone(),
      disposed: self.disposed.clone()
    });

    if delay.is_zero() {
      self.state.drain_until(now);
    }

    Ok(handle)
  }

  fn dispose(&self) {
    self.disposed.store(true, Ordering::Release);
  }

  fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use parking_lot::Mutex;

  use super::*;

  fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_copy = log.clone();
    let make = move |label: &'static str| -> Task {
      let log = log_copy.clone();
      Box::new(move || log.lock().push(label))
    };
    (log, make)
  }

  #[test]
  fn delayed_tasks_wait_for_time_to_advance() {
    let scheduler = VirtualTimeScheduler::new();
    let worker = scheduler.create_worker();
    let (log, task) = recorder();

    worker.schedule(task("one-second"), Duration::from_secs(1)).expect("accepted");
    assert!(log.lock().is_empty());

    scheduler.advance_time_by(Duration::from_millis(999));
    assert!(log.lock().is_empty());

    scheduler.advance_time_by(Duration::from_millis(1));
    assert_eq!(*log.lock(), vec!["one-second"]);
    assert_eq!(scheduler.now(), Duration::from_secs(1));
  }

  #[test]
  fn zero_delay_runs_immediately() {
    let scheduler = VirtualTimeScheduler::new();
    let (log, task) = recorder();

    scheduler.create_worker().schedule(task("now"), Duration::ZERO).expect("accepted");
    assert_eq!(*log.lock(), vec!["now"]);
  }

  #[test]
  fn ties_are_broken_by_submission_order() {
    let scheduler = VirtualTimeScheduler::new();
    let first = scheduler.create_worker();
    let second = scheduler.create_worker();
    let (log, task) = recorder();

    second.schedule(task("b"), Duration::from_secs(2)).expect("accepted");
    first.schedule(task("a"), Duration::from_secs(1)).expect("accepted");
    first.schedule(task("c"), Duration::from_secs(2)).expect("accepted");

    scheduler.advance_time_by(Duration::from_secs(5));
    assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    assert_eq!(scheduler.now(), Duration::from_secs(5));
  }

  #[test]
  fn tasks_see_their_due_time_and_can_reschedule() {
    let scheduler = VirtualTimeScheduler::new();
    let worker = scheduler.create_worker();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let clock = scheduler.clock();
    let seen_copy = seen.clone();
    let worker_copy = worker.clone();
    worker.schedule(Box::new(move || {
      seen_copy.lock().push(clock.now());
      let clock = clock.clone();
      let seen = seen_copy.clone();
      let _ = worker_copy.schedule(Box::new(move || seen.lock().push(clock.now())), Duration::from_secs(1));
    }), Duration::from_secs(1)).expect("accepted");

    scheduler.advance_time_by(Duration::from_secs(3));
    assert_eq!(*seen.lock(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
  }

  #[test]
  fn advance_to_next_jumps_to_earliest_task() {
    let scheduler = VirtualTimeScheduler::new();
    let worker = scheduler.create_worker();
    let (log, task) = recorder();

    worker.schedule(task("late"), Duration::from_secs(10)).expect("accepted");
    worker.schedule(task("early"), Duration::from_secs(3)).expect("accepted");

    assert!(scheduler.advance_to_next());
    assert_eq!(*log.lock(), vec!["early"]);
    assert_eq!(scheduler.now(), Duration::from_secs(3));

    assert!(scheduler.advance_to_next());
    assert!(!scheduler.advance_to_next());
    assert_eq!(scheduler.pending_tasks(), 0);
  }

  #[test]
  fn disposed_worker_tasks_are_skipped() {
    let scheduler = VirtualTimeScheduler::new();
    let worker = scheduler.create_worker();
    let (log, task) = recorder();

    worker.schedule(task("never"), Duration::from_secs(1)).expect("accepted");
    worker.dispose();
    scheduler.advance_time_by(Duration::from_secs(2));

    assert!(log.lock().is_empty());
  }
}
