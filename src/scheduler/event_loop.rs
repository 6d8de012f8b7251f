use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace};

use crate::clock::{ClockRef, SystemClock};
use crate::error::FluxError;
use crate::scheduler::{Scheduler, Task, TaskHandle, Worker, WorkerRef};


///////////////////////////////////////////////////////////////////////////////////////////////////
// EVENT LOOP
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A task waiting in an event loop, ordered by due time then submission sequence.
struct TimedTask {
  due     : Instant,
  sequence: u64,
  task    : Task,
  handle  : TaskHandle,
  disposed: Arc<AtomicBool>
}

impl TimedTask {
  fn is_cancelled(&self) -> bool {
    self.handle.is_cancelled() || self.disposed.load(Ordering::Acquire)
  }
}

impl PartialEq for TimedTask {
  fn eq(&self, other: &Self) -> bool {
    self.due == other.due && self.sequence == other.sequence
  }
}

impl Eq for TimedTask {}

impl Ord for TimedTask {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    // Reversed: `BinaryHeap` is a max-heap and the earliest task must come first
    other.due.cmp(&self.due).then_with(|| other.sequence.cmp(&self.sequence))
  }
}

impl PartialOrd for TimedTask {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

enum Command {
  Schedule(TimedTask),
  /// Drops the tasks of disposed workers and cancelled handles.
  Prune,
  Shutdown
}


/// One OS thread running the tasks sent to it, in due-time order.
///
/// Tasks reach the thread through an unbounded channel; the thread keeps them in a min-heap
/// and sleeps on the channel until either a new task arrives or the earliest one is due.
struct EventLoop {
  sender  : Sender<Command>,
  sequence: AtomicU64
}

impl EventLoop {
  fn spawn(name: &'static str, index: usize) -> Arc<Self> {
    let (sender, receiver) = crossbeam_channel::unbounded();

    let spawned = thread::Builder::new()
      .name(format!("{name}-{index}"))
      .spawn(move || run_loop(receiver));

    // Without a thread, the receiver is dropped and every `schedule` is rejected
    if let Err(cause) = spawned {
      error!(scheduler = name, index, %cause, "failed to spawn event loop thread");
    }

    Arc::new(EventLoop { sender, sequence: AtomicU64::new(0) })
  }

  fn submit(&self, task: TimedTask) -> bool {
    self.sender.send(Command::Schedule(task)).is_ok()
  }

  fn prune(&self) {
    let _ = self.sender.send(Command::Prune);
  }

  fn next_sequence(&self) -> u64 {
    self.sequence.fetch_add(1, Ordering::Relaxed)
  }
}

impl Drop for EventLoop {
  fn drop(&mut self) {
    let _ = self.sender.send(Command::Shutdown);
  }
}

fn run_loop(receiver: Receiver<Command>) {
  let mut queue: BinaryHeap<TimedTask> = BinaryHeap::new();

  loop {
    // Run every task that is due
    while queue.peek().map_or(false, |next| next.due <= Instant::now()) {
      if let Some(timed) = queue.pop() {
        run_task(timed);
      }
    }

    while queue.peek().map_or(false, TimedTask::is_cancelled) {
      queue.pop();
    }
    trace!(pending = queue.len(), "event loop waiting");

    let command = match queue.peek() {
      Some(next) => match receiver.recv_deadline(next.due) {
        Ok(command)                         => Some(command),
        Err(RecvTimeoutError::Timeout)      => None,
        Err(RecvTimeoutError::Disconnected) => break
      },
      None => match receiver.recv() {
        Ok(command) => Some(command),
        Err(_)      => break
      }
    };

    match command {
      Some(Command::Schedule(timed)) => queue.push(timed),
      Some(Command::Prune)           => {
        let before = queue.len();
        queue.retain(|timed| !timed.is_cancelled());
        trace!(pruned = before - queue.len(), "event loop pruned cancelled tasks");
      },
      Some(Command::Shutdown)        => break,
      None                           => ()
    }
  }

  debug!(dropped = queue.len(), "event loop stopped");
}

fn run_task(timed: TimedTask) {
  if timed.is_cancelled() {
    return;
  }

  if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(timed.task)) {
    let message = payload.downcast_ref::<&str>().map(|s| s.to_string())
      .or_else(|| payload.downcast_ref::<String>().cloned())
      .unwrap_or_else(|| "non-string panic payload".to_string());
    error!(%message, "task panicked on event loop");
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// EVENT LOOP SCHEDULER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A scheduler made of one or several event loops.
///
/// * `single` has one loop: all its workers share one thread and are serialized.
/// * `parallel(n)` has `n` loops, handed out round-robin to new workers.
///
/// Dropping the scheduler (and every worker it created) stops its threads.
pub struct EventLoopScheduler {
  name : &'static str,
  loops: Vec<Arc<EventLoop>>,
  next : AtomicUsize,
  clock: Arc<SystemClock>
}

impl EventLoopScheduler {
  /// Creates a scheduler with a single event loop.
  pub fn single(name: &'static str) -> Self {
    Self::with_loops(name, 1)
  }

  /// Creates a scheduler with `loops` event loops (at least one).
  pub fn parallel(name: &'static str, loops: usize) -> Self {
    Self::with_loops(name, loops.max(1))
  }

  fn with_loops(name: &'static str, count: usize) -> Self {
    debug!(scheduler = name, loops = count, "starting event loops");

    EventLoopScheduler {
      name,
      loops: (0..count).map(|index| EventLoop::spawn(name, index)).collect(),
      next : AtomicUsize::new(0),
      clock: Arc::new(SystemClock::new())
    }
  }

  /// Number of event loops (and thus of threads) of this scheduler.
  pub fn parallelism(&self) -> usize {
    self.loops.len()
  }
}

impl Scheduler for EventLoopScheduler {
  fn create_worker(&self) -> WorkerRef {
    let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();

    Arc::new(EventLoopWorker {
      scheduler : self.name,
      event_loop: self.loops[index].clone(),
      disposed  : Arc::new(AtomicBool::new(false))
    })
  }

  fn clock(&self) -> ClockRef {
    self.clock.clone()
  }

  fn name(&self) -> &'static str {
    self.name
  }
}


/// Worker pinned to one event loop.
struct EventLoopWorker {
  scheduler : &'static str,
  event_loop: Arc<EventLoop>,
  disposed  : Arc<AtomicBool>
}

impl Worker for EventLoopWorker {
  fn schedule(&self, task: Task, delay: Duration) -> Result<TaskHandle, FluxError> {
    if self.is_disposed() {
      return Err(FluxError::Rejected { scheduler: self.scheduler, reason: "worker disposed".into() });
    }

    let handle = TaskHandle::new();
    let timed = TimedTask {
      due     : Instant::now() + delay,
      sequence: self.event_loop.next_sequence(),
      task,
      handle  : handle.clone(),
      disposed: self.disposed.clone()
    };

    if self.event_loop.submit(timed) {
      Ok(handle)
    }
    else {
      Err(FluxError::Rejected { scheduler: self.scheduler, reason: "event loop stopped".into() })
    }
  }

  fn dispose(&self) {
    if !self.disposed.swap(true, Ordering::AcqRel) {
      self.event_loop.prune();
    }
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
  use std::collections::HashSet;

  use super::*;

  const WAIT: Duration = Duration::from_secs(5);

  #[test]
  fn runs_tasks_in_due_order_then_submission_order() {
    let scheduler = EventLoopScheduler::single("test-single");
    let worker = scheduler.create_worker();
    let (sender, receiver) = crossbeam_channel::unbounded();

    for (label, delay_ms) in [("late", 60u64), ("first-tie", 20), ("second-tie", 20), ("now", 0)] {
      let sender = sender.clone();
      worker.schedule(Box::new(move || { let _ = sender.send(label); }), Duration::from_millis(delay_ms))
        .expect("loop is running");
    }

    let order: Vec<_> = (0..4).map(|_| receiver.recv_timeout(WAIT).expect("task ran")).collect();
    assert_eq!(order, vec!["now", "first-tie", "second-tie", "late"]);
  }

  #[test]
  fn dispose_cancels_pending_tasks() {
    let scheduler = EventLoopScheduler::single("test-dispose");
    let worker = scheduler.create_worker();
    let (sender, receiver) = crossbeam_channel::unbounded::<&str>();

    let cancelled = sender.clone();
    worker.schedule(Box::new(move || { let _ = cancelled.send("cancelled"); }), Duration::from_millis(50))
      .expect("loop is running");
    worker.dispose();

    let other = scheduler.create_worker();
    other.schedule(Box::new(move || { let _ = sender.send("other"); }), Duration::from_millis(100))
      .expect("loop is running");

    assert_eq!(receiver.recv_timeout(WAIT), Ok("other"));
    assert!(worker.schedule(Box::new(|| ()), Duration::ZERO).is_err());
  }

  #[test]
  fn dispose_releases_far_away_tasks() {
    let scheduler = EventLoopScheduler::single("test-prune");
    let worker = scheduler.create_worker();
    let marker = Arc::new(());

    let held = marker.clone();
    worker.schedule(Box::new(move || { let _ = &held; }), Duration::from_secs(3600))
      .expect("loop is running");
    worker.dispose();

    let deadline = Instant::now() + WAIT;
    while Arc::strong_count(&marker) > 1 && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(Arc::strong_count(&marker), 1);
  }

  #[test]
  fn cancelled_handle_skips_task() {
    let scheduler = EventLoopScheduler::single("test-cancel");
    let worker = scheduler.create_worker();
    let (sender, receiver) = crossbeam_channel::unbounded::<&str>();

    let skipped = sender.clone();
    let handle = worker.schedule(Box::new(move || { let _ = skipped.send("skipped"); }), Duration::from_millis(30))
      .expect("loop is running");
    handle.cancel();
    worker.schedule(Box::new(move || { let _ = sender.send("kept"); }), Duration::from_millis(60))
      .expect("loop is running");

    assert_eq!(receiver.recv_timeout(WAIT), Ok("kept"));
  }

  #[test]
  fn parallel_workers_use_distinct_threads() {
    let scheduler = EventLoopScheduler::parallel("test-parallel", 3);
    assert_eq!(scheduler.parallelism(), 3);
    let (sender, receiver) = crossbeam_channel::unbounded();

    for _ in 0..3 {
      let sender = sender.clone();
      scheduler.create_worker()
        .schedule(Box::new(move || { let _ = sender.send(thread::current().id()); }), Duration::ZERO)
        .expect("loop is running");
    }

    let threads: HashSet<_> = (0..3).map(|_| receiver.recv_timeout(WAIT).expect("task ran")).collect();
    assert_eq!(threads.len(), 3);
  }

  #[test]
  fn panicking_task_does_not_stop_the_loop() {
    let scheduler = EventLoopScheduler::single("test-panic");
    let worker = scheduler.create_worker();
    let (sender, receiver) = crossbeam_channel::unbounded();

    worker.schedule(Box::new(|| panic!("boom")), Duration::ZERO).expect("loop is running");
    worker.schedule(Box::new(move || { let _ = sender.send(42); }), Duration::ZERO).expect("loop is running");

    assert_eq!(receiver.recv_timeout(WAIT), Ok(42));
  }
}
