use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FluxError;


/// Demand sentinel removing any limit on the number of items delivered.
pub const UNBOUNDED: u64 = u64::MAX;


///////////////////////////////////////////////////////////////////////////////////////////////////
// SIGNAL
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The events flowing downstream, as a value.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal<T> {
  /// An item.
  Next(T),
  /// Terminal failure.
  Error(FluxError),
  /// Terminal success.
  Complete,
}



///////////////////////////////////////////////////////////////////////////////////////////////////
// SUBSCRIPTION & SUBSCRIBER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The live session between one source and one subscriber.
///
/// Both methods may be called from any thread, including re-entrantly from within
/// `Subscriber::on_next`. Neither ever delivers a signal on the caller's stack while the
/// subscriber is already handling one.
pub trait Subscription: Send + Sync + 'static {
  /// Authorizes the delivery of `n` more items. `n` must be at least one; `UNBOUNDED`
  /// lifts the limit for good.
  fn request(&self, n: u64);

  /// Stops the delivery of signals and releases upstream resources. Idempotent.
  fn cancel(&self);
}

/// A shared subscription reference.
pub type SubscriptionRef = Arc<dyn Subscription>;


/// The receiving end of a source.
///
/// A subscriber first receives `on_subscribe`, then any number of `on_next` calls (never
/// more than it requested), then at most one of `on_error` or `on_complete`. Signals are
/// never delivered concurrently.
pub trait Subscriber<T>: Send + 'static {
  /// Called once, before any other signal.
  fn on_subscribe(&mut self, subscription: SubscriptionRef);

  /// Called for each item.
  fn on_next(&mut self, value: T);

  /// Terminal failure.
  fn on_error(&mut self, error: FluxError);

  /// Terminal success.
  fn on_complete(&mut self);
}

/// A boxed subscriber, as accepted by `Source::subscribe`.
pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

impl<T, S> Subscriber<T> for Box<S>
where
  S: Subscriber<T> + ?Sized
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    (**self).on_subscribe(subscription);
  }

  fn on_next(&mut self, value: T) {
    (**self).on_next(value);
  }

  fn on_error(&mut self, error: FluxError) {
    (**self).on_error(error);
  }

  fn on_complete(&mut self) {
    (**self).on_complete();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// DEMAND
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Outstanding demand: requested but not yet delivered items.
///
/// Additions saturate at `UNBOUNDED`, which is sticky and never decremented.
#[derive(Debug, Default)]
pub struct Demand {
  value: AtomicU64
}

impl Demand {
  /// Creates an empty demand.
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds `n` to the outstanding demand.
  pub fn add(&self, n: u64) {
    let _ = self.value.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
      Some(if current == UNBOUNDED { UNBOUNDED } else { current.saturating_add(n) })
    });
  }

  /// Consumes one unit of demand, returning `false` when none is outstanding.
  pub fn try_take(&self) -> bool {
    self.value.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match current {
      0         => None,
      UNBOUNDED => Some(UNBOUNDED),
      n         => Some(n - 1)
    }).is_ok()
  }

  /// Current outstanding demand.
  pub fn get(&self) -> u64 {
    self.value.load(Ordering::Acquire)
  }

  /// Whether `UNBOUNDED` was requested.
  pub fn is_unbounded(&self) -> bool {
    self.get() == UNBOUNDED
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// WORK IN PROGRESS
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Guards a drain loop so that it runs on one thread at a time and never re-enters itself.
///
/// A caller that fails to `enter` has its work recorded as *missed*: the thread currently
/// draining will loop once more before leaving.
#[derive(Debug, Default)]
pub(crate) struct WorkInProgress {
  count: AtomicUsize
}

impl WorkInProgress {
  /// A guard already held by its creator, who must run `drain` to release it.
  pub fn held() -> Self {
    WorkInProgress { count: AtomicUsize::new(1) }
  }

  /// Tries to become the draining thread.
  pub fn enter(&self) -> bool {
    self.count.fetch_add(1, Ordering::AcqRel) == 0
  }

  /// Runs `work` until no call was missed, then releases the guard.
  /// Must only be called by the thread that entered (or created a held guard).
  pub fn drain(&self, mut work: impl FnMut()) {
    let mut missed = 1;
    loop {
      work();
      let remaining = self.count.fetch_sub(missed, Ordering::AcqRel) - missed;
      if remaining == 0 {
        return;
      }
      missed = remaining;
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// EMPTY SUBSCRIPTION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A subscription with nothing behind it, for sources terminating right away.
pub struct EmptySubscription;

impl EmptySubscription {
  /// A shared `EmptySubscription`.
  pub fn shared() -> SubscriptionRef {
    Arc::new(EmptySubscription)
  }
}

impl Subscription for EmptySubscription {
  fn request(&self, _n: u64) {}

  fn cancel(&self) {}
}

/// Completes `subscriber` without any item.
pub fn complete_empty<T: 'static>(subscriber: &mut dyn Subscriber<T>) {
  subscriber.on_subscribe(EmptySubscription::shared());
  subscriber.on_complete();
}

/// Fails `subscriber` right away.
pub fn fail_immediately<T: 'static>(subscriber: &mut dyn Subscriber<T>, error: FluxError) {
  subscriber.on_subscribe(EmptySubscription::shared());
  subscriber.on_error(error);
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// COMPOSITE SUBSCRIPTION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The upstream subscriptions of a stage with several inputs, cancelled all at once.
///
/// Once released, every subscription attached later is cancelled on arrival.
pub(crate) struct CompositeSubscription {
  inputs: Mutex<Option<Vec<SubscriptionRef>>>
}

impl CompositeSubscription {
  pub fn new() -> Self {
    CompositeSubscription { inputs: Mutex::new(Some(Vec::new())) }
  }

  /// Keeps `subscription`, or cancels it when the composite was already released.
  pub fn attach(&self, subscription: SubscriptionRef) -> bool {
    {
      let mut inputs = self.inputs.lock();
      if let Some(inputs) = inputs.as_mut() {
        inputs.push(subscription);
        return true;
      }
    }
    subscription.cancel();
    false
  }

  /// Cancels every attached subscription. Idempotent.
  pub fn release(&self) {
    let inputs = self.inputs.lock().take();
    for input in inputs.into_iter().flatten() {
      input.cancel();
    }
  }

  pub fn is_released(&self) -> bool {
    self.inputs.lock().is_none()
  }
}

impl Default for CompositeSubscription {
  fn default() -> Self {
    Self::new()
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// DEFERRED SUBSCRIPTION
///////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct DeferredState {
  upstream    : Option<SubscriptionRef>,
  pending     : u64,
  zero_request: bool,
  cancelled   : bool
}

/// A subscription handed downstream before the real upstream subscription exists.
///
/// Demand and cancellation received in the meantime are replayed onto the upstream as
/// soon as it is `set`.
#[derive(Default)]
pub struct DeferredSubscription {
  state: Mutex<DeferredState>
}

impl DeferredSubscription {
  /// Creates an empty deferred subscription.
  pub fn new() -> Self {
    Self::default()
  }

  /// Attaches the upstream subscription and replays what was recorded so far.
  /// A second upstream is cancelled right away.
  pub fn set(&self, upstream: SubscriptionRef) {
    let (pending, zero_request, cancelled) = {
      let mut state = self.state.lock();
      if state.upstream.is_some() {
        drop(state);
        upstream.cancel();
        return;
      }
      state.upstream = Some(upstream.clone());
      (std::mem::take(&mut state.pending), state.zero_request, state.cancelled)
    };

    if cancelled {
      upstream.cancel();
      return;
    }
    if zero_request {
      upstream.request(0);
    }
    if pending > 0 {
      upstream.request(pending);
    }
  }

  /// Whether `cancel` was called.
  pub fn is_cancelled(&self) -> bool {
    self.state.lock().cancelled
  }
}

impl Subscription for DeferredSubscription {
  fn request(&self, n: u64) {
    let upstream = {
      let mut state = self.state.lock();
      match &state.upstream {
        Some(upstream) => upstream.clone(),
        None => {
          if n == 0 {
            state.zero_request = true;
          }
          state.pending = if n == UNBOUNDED { UNBOUNDED } else { state.pending.saturating_add(n) };
          return;
        }
      }
    };
    upstream.request(n);
  }

  fn cancel(&self) {
    let upstream = {
      let mut state = self.state.lock();
      state.cancelled = true;
      state.upstream.clone()
    };
    if let Some(upstream) = upstream {
      upstream.cancel();
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct Recording {
    requested: Mutex<Vec<u64>>,
    cancelled: Mutex<bool>
  }

  impl Subscription for Recording {
    fn request(&self, n: u64) {
      self.requested.lock().push(n);
    }

    fn cancel(&self) {
      *self.cancelled.lock() = true;
    }
  }

  #[test]
  fn demand_saturates_and_unbounded_is_sticky() {
    let demand = Demand::new();
    assert!(!demand.try_take());

    demand.add(2);
    assert!(demand.try_take());
    assert!(demand.try_take());
    assert!(!demand.try_take());

    demand.add(UNBOUNDED - 1);
    demand.add(10);
    assert!(demand.is_unbounded());
    assert!(demand.try_take());
    assert!(demand.is_unbounded());
  }

  #[test]
  fn work_in_progress_records_missed_work() {
    let wip = WorkInProgress::default();
    assert!(wip.enter());

    let mut rounds = 0;
    wip.drain(|| {
      rounds += 1;
      if rounds == 1 {
        // A concurrent caller arrives while we drain
        assert!(!wip.enter());
      }
    });

    assert_eq!(rounds, 2);
    assert!(wip.enter());
  }

  #[test]
  fn composite_cancels_late_arrivals() {
    let composite = CompositeSubscription::new();
    let early = Arc::new(Recording::default());
    assert!(composite.attach(early.clone()));

    composite.release();
    composite.release();
    assert!(*early.cancelled.lock());
    assert!(composite.is_released());

    let late = Arc::new(Recording::default());
    assert!(!composite.attach(late.clone()));
    assert!(*late.cancelled.lock());
  }

  #[test]
  fn deferred_subscription_replays_demand() {
    let deferred = DeferredSubscription::new();
    deferred.request(3);
    deferred.request(4);

    let upstream = Arc::new(Recording::default());
    deferred.set(upstream.clone());
    deferred.request(1);

    assert_eq!(*upstream.requested.lock(), vec![7, 1]);
    assert!(!*upstream.cancelled.lock());
  }

  #[test]
  fn deferred_subscription_replays_cancellation() {
    let deferred = DeferredSubscription::new();
    deferred.request(UNBOUNDED);
    deferred.cancel();

    let upstream = Arc::new(Recording::default());
    deferred.set(upstream.clone());

    assert!(upstream.requested.lock().is_empty());
    assert!(*upstream.cancelled.lock());
    assert!(deferred.is_cancelled());
  }

  #[test]
  fn deferred_subscription_rejects_second_upstream() {
    let deferred = DeferredSubscription::new();
    let first = Arc::new(Recording::default());
    let second = Arc::new(Recording::default());

    deferred.set(first.clone());
    deferred.set(second.clone());

    assert!(!*first.cancelled.lock());
    assert!(*second.cancelled.lock());
  }
}
