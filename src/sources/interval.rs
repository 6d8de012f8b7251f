use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::ClockRef;
use crate::error::FluxError;
use crate::scheduler::{SchedulerRef, WorkerRef};
use crate::source::Source;
use crate::subscription::{BoxSubscriber, Demand, Subscription};


///////////////////////////////////////////////////////////////////////////////////////////////////
// INTERVAL
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Emits 0, 1, 2, … every `period`, starting one period after subscription. Never completes.
///
/// A tick finding no outstanding demand fails the subscription with `FluxError::Overflow`.
#[derive(Clone)]
pub struct Interval {
  period   : Duration,
  scheduler: SchedulerRef
}

impl Interval {
  pub(crate) fn new(period: Duration, scheduler: SchedulerRef) -> Self {
    Interval { period, scheduler }
  }
}

impl Source for Interval {
  type Item = u64;

  fn subscribe(&self, subscriber: BoxSubscriber<u64>) {
    let clock = self.scheduler.clock();
    let ticker = Arc::new(Ticker {
      downstream: Mutex::new(None),
      demand    : Demand::new(),
      worker    : self.scheduler.create_worker(),
      start     : clock.now(),
      clock,
      period    : self.period,
      count     : AtomicU64::new(0),
      cancelled : AtomicBool::new(false),
      violated  : AtomicBool::new(false)
    });

    let mut subscriber = subscriber;
    subscriber.on_subscribe(ticker.clone());
    *ticker.downstream.lock() = Some(subscriber);
    Ticker::schedule_next(&ticker);
  }
}


struct Ticker {
  downstream: Mutex<Option<BoxSubscriber<u64>>>,
  demand    : Demand,
  worker    : WorkerRef,
  clock     : ClockRef,
  start     : Duration,
  period    : Duration,
  count     : AtomicU64,
  cancelled : AtomicBool,
  violated  : AtomicBool
}

impl Ticker {
  /// Schedules the next tick against the subscription time, so that ticks do not drift.
  fn schedule_next(ticker: &Arc<Ticker>) {
    if ticker.cancelled.load(Ordering::Acquire) {
      return;
    }

    let index = ticker.count.load(Ordering::Acquire);
    let due = ticker.start + ticker.period.saturating_mul((index + 1).min(u32::MAX as u64) as u32);
    let delay = due.saturating_sub(ticker.clock.now());

    let next = ticker.clone();
    if let Err(error) = ticker.worker.schedule(Box::new(move || next.tick()), delay) {
      warn!(%error, "interval could not schedule its next tick");
      ticker.fail(error);
    }
  }

  fn tick(self: Arc<Self>) {
    let index = self.count.fetch_add(1, Ordering::AcqRel);
    {
      let mut slot = self.downstream.lock();
      if self.cancelled.load(Ordering::Acquire) {
        slot.take();
        return;
      }
      let Some(downstream) = slot.as_mut() else { return };

      if self.violated.load(Ordering::Acquire) {
        drop(slot);
        self.fail(FluxError::protocol("request(n) requires n >= 1"));
        return;
      }
      if self.demand.try_take() {
        downstream.on_next(index);
      }
      else {
        drop(slot);
        self.fail(FluxError::Overflow { source_name: "interval", index });
        return;
      }
    }
    Ticker::schedule_next(&self);
  }

  fn fail(&self, error: FluxError) {
    self.cancelled.store(true, Ordering::Release);
    self.worker.dispose();
    let downstream = self.downstream.lock().take();
    if let Some(mut downstream) = downstream {
      downstream.on_error(error);
    }
  }
}

impl Subscription for Ticker {
  fn request(&self, n: u64) {
    // Reported by the next tick, which owns the downstream
    if n == 0 {
      self.violated.store(true, Ordering::Release);
      return;
    }
    self.demand.add(n);
  }

  fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      debug!(ticks = self.count.load(Ordering::Acquire), "interval cancelled");
      self.worker.dispose();
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
