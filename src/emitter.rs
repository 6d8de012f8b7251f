use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::FluxError;
use crate::subscription::{BoxSubscriber, Demand, SubscriptionRef, WorkInProgress};


///////////////////////////////////////////////////////////////////////////////////////////////////
// EMITTER
///////////////////////////////////////////////////////////////////////////////////////////////////

enum Terminal {
  Complete,
  Error(FluxError)
}

/// A serialized, demand-aware delivery point in front of one downstream subscriber.
///
/// Any number of threads may push items and terminal signals into an emitter; it queues
/// them and delivers them one at a time, never beyond the downstream's demand. Errors
/// overtake queued items, completion waits for them. Nothing is delivered before `start`.
pub(crate) struct Emitter<T> {
  downstream: Mutex<Option<BoxSubscriber<T>>>,
  queue     : Mutex<VecDeque<T>>,
  terminal  : Mutex<Option<Terminal>>,
  demand    : Demand,
  wip       : WorkInProgress,
  cancelled : AtomicBool
}

impl<T> Emitter<T>
where
  T: Send + 'static
{
  /// Wraps `downstream`; signals pushed before `start` are held back.
  pub fn new(downstream: BoxSubscriber<T>) -> Self {
    Emitter {
      downstream: Mutex::new(Some(downstream)),
      queue     : Mutex::new(VecDeque::new()),
      terminal  : Mutex::new(None),
      demand    : Demand::new(),
      wip       : WorkInProgress::held(),
      cancelled : AtomicBool::new(false)
    }
  }

  /// Hands `subscription` to the downstream, then delivers what arrived meanwhile.
  /// Must be called exactly once.
  pub fn start(&self, subscription: SubscriptionRef) {
    if let Some(downstream) = self.downstream.lock().as_mut() {
      downstream.on_subscribe(subscription);
    }
    self.wip.drain(|| self.deliver());
  }

  /// Queues an item. Dropped once the emitter is cancelled or terminated.
  pub fn next(&self, value: T) {
    if self.is_terminated() {
      return;
    }
    self.queue.lock().push_back(value);
    self.drain();
  }

  /// Completes the downstream once every queued item has been delivered.
  pub fn complete(&self) {
    self.terminate(Terminal::Complete);
  }

  /// Fails the downstream as soon as possible, discarding queued items.
  pub fn error(&self, error: FluxError) {
    self.terminate(Terminal::Error(error));
  }

  /// Adds downstream demand. Returns `false` (and fails the downstream) for `n == 0`.
  pub fn request(&self, n: u64) -> bool {
    if n == 0 {
      self.error(FluxError::protocol("request(n) requires n >= 1"));
      return false;
    }
    self.demand.add(n);
    self.drain();
    true
  }

  /// Stops every further delivery and releases the downstream.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
    self.drain();
  }

  /// Whether the downstream asked for more items than are queued.
  pub fn has_room(&self) -> bool {
    self.demand.get() > self.queue.lock().len() as u64
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }

  /// Whether a terminal signal has been pushed (delivered or not) or the emitter was cancelled.
  pub fn is_terminated(&self) -> bool {
    self.is_cancelled() || self.terminal.lock().is_some()
  }

  fn terminate(&self, signal: Terminal) {
    {
      let mut terminal = self.terminal.lock();
      if terminal.is_some() {
        return;
      }
      *terminal = Some(signal);
    }
    self.drain();
  }

  fn drain(&self) {
    if self.wip.enter() {
      self.wip.drain(|| self.deliver());
    }
  }

  /// One delivery round. Runs on the draining thread only.
  fn deliver(&self) {
    let mut slot = self.downstream.lock();

    loop {
      if self.is_cancelled() {
        slot.take();
        self.queue.lock().clear();
        return;
      }

      let downstream = match slot.as_mut() {
        Some(downstream) => downstream,
        None => {
          self.queue.lock().clear();
          return;
        }
      };

      let failed = matches!(*self.terminal.lock(), Some(Terminal::Error(_)));
      if failed {
        let error = match self.terminal.lock().take() {
          Some(Terminal::Error(error)) => error,
          _ => return
        };
        // Keep a marker so that later pushes see the emitter as terminated
        *self.terminal.lock() = Some(Terminal::Complete);
        self.queue.lock().clear();
        if let Some(mut downstream) = slot.take() {
          downstream.on_error(error);
        }
        return;
      }

      if self.demand.get() > 0 {
        let value = self.queue.lock().pop_front();
        if let Some(value) = value {
          self.demand.try_take();
          downstream.on_next(value);
          continue;
        }
      }

      let completed = self.queue.lock().is_empty()
        && matches!(*self.terminal.lock(), Some(Terminal::Complete));
      if completed {
        if let Some(mut downstream) = slot.take() {
          downstream.on_complete();
        }
      }
      return;
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
