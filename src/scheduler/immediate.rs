use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{ClockRef, SystemClock};
use crate::error::FluxError;
use crate::scheduler::{Scheduler, Task, TaskHandle, Worker, WorkerRef};


///////////////////////////////////////////////////////////////////////////////////////////////////
// IMMEDIATE SCHEDULER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Runs tasks right away, on the thread that schedules them.
///
/// Delayed tasks cannot be honoured without blocking the caller, so they are rejected.
pub struct ImmediateScheduler {
  clock: Arc<SystemClock>
}

impl ImmediateScheduler {
  /// Creates a new `ImmediateScheduler`.
  pub fn new() -> Self {
    ImmediateScheduler { clock: Arc::new(SystemClock::new()) }
  }
}

impl Default for ImmediateScheduler {
  fn default() -> Self {
    Self::new()
  }
}

impl Scheduler for ImmediateScheduler {
  fn create_worker(&self) -> WorkerRef {
    Arc::new(ImmediateWorker { disposed: AtomicBool::new(false) })
  }

  fn clock(&self) -> ClockRef {
    self.clock.clone()
  }

  fn name(&self) -> &'static str {
    "immediate"
  }
}


/// Worker of the `ImmediateScheduler`.
struct ImmediateWorker {
  disposed: AtomicBool
}

impl Worker for ImmediateWorker {
  fn schedule(&self, task: Task, delay: Duration) -> Result<TaskHandle, FluxError> {
    if self.is_disposed() {
      return Err(FluxError::Rejected { scheduler: "immediate", reason: "worker disposed".into() });
    }
    if !delay.is_zero() {
      return Err(FluxError::Rejected {
        scheduler: "immediate",
        reason: format!("cannot delay a task by {delay:?}")
      });
    }

    task();
    Ok(TaskHandle::new())
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
  use std::sync::atomic::AtomicUsize;

  use super::*;

  #[test]
  fn runs_on_the_caller() {
    let worker = ImmediateScheduler::new().create_worker();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_copy = runs.clone();

    worker.schedule(Box::new(move || { runs_copy.fetch_add(1, Ordering::SeqCst); }), Duration::ZERO)
      .expect("zero delay is accepted");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn rejects_delays_and_disposed_workers() {
    let worker = ImmediateScheduler::new().create_worker();

    let delayed = worker.schedule(Box::new(|| ()), Duration::from_millis(1));
    assert!(matches!(delayed, Err(FluxError::Rejected { .. })));

    worker.dispose();
    let after_dispose = worker.schedule(Box::new(|| ()), Duration::ZERO);
    assert!(matches!(after_dispose, Err(FluxError::Rejected { .. })));
  }
}
