use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::FluxError;
use crate::subscription::{Demand, Subscriber, Subscription, SubscriptionRef, UNBOUNDED};


///////////////////////////////////////////////////////////////////////////////////////////////////
// STRICT SUBSCRIBER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Violations of the demand protocol observed by a `StrictSubscriber`.
#[derive(Clone, Debug, Default)]
pub struct ViolationLog {
  entries: Arc<Mutex<Vec<String>>>
}

impl ViolationLog {
  fn record(&self, violation: String) {
    error!(%violation, "reactive streams protocol violation");
    self.entries.lock().push(violation);
  }

  /// Every violation recorded so far.
  pub fn entries(&self) -> Vec<String> {
    self.entries.lock().clone()
  }

  /// Whether no violation was recorded.
  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }
}

/// Counts the demand its subscriber issues, so that more items than requested can be
/// reported.
struct CountingSubscription {
  upstream: SubscriptionRef,
  demand  : Arc<Demand>
}

impl Subscription for CountingSubscription {
  fn request(&self, n: u64) {
    self.demand.add(n);
    self.upstream.request(n);
  }

  fn cancel(&self) {
    self.upstream.cancel();
  }
}

/// A subscriber checking the demand contract on behalf of the subscriber it wraps.
///
/// An item arriving without demand cancels the upstream and fails the inner subscriber
/// with `FluxError::ProtocolViolation`; signals arriving after a terminal signal are
/// dropped. Both are recorded in the `ViolationLog`.
pub struct StrictSubscriber<S> {
  inner     : S,
  demand    : Arc<Demand>,
  upstream  : Option<SubscriptionRef>,
  terminated: bool,
  violations: ViolationLog
}

impl<S> StrictSubscriber<S> {
  /// Wraps `inner`, returning the log violations will be recorded in.
  pub fn new(inner: S) -> (Self, ViolationLog) {
    let violations = ViolationLog::default();
    let strict = StrictSubscriber {
      inner,
      demand    : Arc::new(Demand::new()),
      upstream  : None,
      terminated: false,
      violations: violations.clone()
    };
    (strict, violations)
  }
}

impl<T, S> Subscriber<T> for StrictSubscriber<S>
where
  S: Subscriber<T>
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.upstream.is_some() {
      self.violations.record("on_subscribe called twice".into());
      subscription.cancel();
      return;
    }
    self.upstream = Some(subscription.clone());
    self.inner.on_subscribe(Arc::new(CountingSubscription {
      upstream: subscription,
      demand  : self.demand.clone()
    }));
  }

  fn on_next(&mut self, value: T) {
    if self.terminated {
      self.violations.record("on_next after a terminal signal".into());
      return;
    }
    if !self.demand.try_take() {
      self.violations.record("on_next without outstanding demand".into());
      self.terminated = true;
      if let Some(upstream) = &self.upstream {
        upstream.cancel();
      }
      self.inner.on_error(FluxError::protocol("more items delivered than requested"));
      return;
    }
    self.inner.on_next(value);
  }

  fn on_error(&mut self, error: FluxError) {
    if self.terminated {
      self.violations.record(format!("on_error after a terminal signal: {error}"));
      return;
    }
    self.terminated = true;
    self.inner.on_error(error);
  }

  fn on_complete(&mut self) {
    if self.terminated {
      self.violations.record("on_complete after a terminal signal".into());
      return;
    }
    self.terminated = true;
    self.inner.on_complete();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// DISPOSABLE
///////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct DisposableState {
  subscription: Mutex<Option<SubscriptionRef>>,
  disposed    : AtomicBool
}

/// Handle returned by the `subscribe_*` entry points, cancelling the subscription on demand.
#[derive(Clone, Default)]
pub struct Disposable {
  state: Arc<DisposableState>
}

impl Disposable {
  fn attach(&self, subscription: SubscriptionRef) -> bool {
    if self.is_disposed() {
      subscription.cancel();
      return false;
    }
    *self.state.subscription.lock() = Some(subscription);
    // `dispose` may have raced with the attachment
    if self.is_disposed() {
      self.dispose();
      return false;
    }
    true
  }

  /// Cancels the subscription. Idempotent.
  pub fn dispose(&self) {
    self.state.disposed.store(true, Ordering::Release);
    let subscription = self.state.subscription.lock().take();
    if let Some(subscription) = subscription {
      subscription.cancel();
    }
  }

  /// Whether `dispose` was called.
  pub fn is_disposed(&self) -> bool {
    self.state.disposed.load(Ordering::Acquire)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// LAMBDA SUBSCRIBER
///////////////////////////////////////////////////////////////////////////////////////////////////

type NextHandler<T> = Box<dyn FnMut(T) + Send>;
type ErrorHandler = Box<dyn FnMut(FluxError) + Send>;
type CompleteHandler = Box<dyn FnOnce() + Send>;

/// A subscriber made of closures, requesting unbounded demand.
///
/// Without an error handler, errors are logged at the error level.
pub struct LambdaSubscriber<T> {
  on_next    : NextHandler<T>,
  on_error   : Option<ErrorHandler>,
  on_complete: Option<CompleteHandler>,
  disposable : Disposable
}

impl<T> LambdaSubscriber<T> {
  /// Creates a subscriber out of optional handlers.
  pub fn new(
    on_next    : NextHandler<T>,
    on_error   : Option<ErrorHandler>,
    on_complete: Option<CompleteHandler>
  ) -> Self {
    LambdaSubscriber { on_next, on_error, on_complete, disposable: Disposable::default() }
  }

  /// The handle cancelling this subscriber's subscription.
  pub fn disposable(&self) -> Disposable {
    self.disposable.clone()
  }
}

impl<T> Subscriber<T> for LambdaSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.disposable.attach(subscription.clone()) {
      subscription.request(UNBOUNDED);
    }
  }

  fn on_next(&mut self, value: T) {
    (self.on_next)(value);
  }

  fn on_error(&mut self, error: FluxError) {
    match self.on_error.as_mut() {
      Some(handler) => handler(error),
      None => error!(%error, kind = error.kind(), "error reached a subscriber without error handler")
    }
  }

  fn on_complete(&mut self) {
    debug!("lambda subscriber completed");
    if let Some(handler) = self.on_complete.take() {
      handler();
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;
  use crate::subscription::EmptySubscription;

  #[derive(Default)]
  struct Cancelled(AtomicBool);

  impl Subscription for Cancelled {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {
      self.0.store(true, Ordering::SeqCst);
    }
  }

  struct Requesting {
    request: u64,
    seen   : Arc<Mutex<Vec<Result<u32, String>>>>
  }

  impl Subscriber<u32> for Requesting {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
      subscription.request(self.request);
    }

    fn on_next(&mut self, value: u32) {
      self.seen.lock().push(Ok(value));
    }

    fn on_error(&mut self, error: FluxError) {
      self.seen.lock().push(Err(error.kind().to_string()));
    }

    fn on_complete(&mut self) {}
  }

  #[test]
  fn strict_subscriber_reports_excess_items() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (mut strict, violations) = StrictSubscriber::new(Requesting { request: 1, seen: seen.clone() });
    let upstream = Arc::new(Cancelled::default());

    strict.on_subscribe(upstream.clone());
    strict.on_next(1);
    strict.on_next(2);
    strict.on_next(3);

    assert_eq!(*seen.lock(), vec![Ok(1), Err("ProtocolViolation".to_string())]);
    assert!(upstream.0.load(Ordering::SeqCst));
    assert_eq!(violations.entries().len(), 2);
  }

  #[test]
  fn strict_subscriber_reports_signals_after_terminal() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (mut strict, violations) = StrictSubscriber::new(Requesting { request: UNBOUNDED, seen });

    strict.on_subscribe(EmptySubscription::shared());
    Subscriber::<u32>::on_complete(&mut strict);
    Subscriber::<u32>::on_complete(&mut strict);

    assert_eq!(violations.entries(), vec!["on_complete after a terminal signal".to_string()]);
  }

  #[test]
  fn disposed_lambda_cancels_late_subscription() {
    let subscriber = LambdaSubscriber::<u32>::new(Box::new(|_| ()), None, None);
    let disposable = subscriber.disposable();
    disposable.dispose();

    let mut subscriber = subscriber;
    let upstream = Arc::new(Cancelled::default());
    subscriber.on_subscribe(upstream.clone());

    assert!(upstream.0.load(Ordering::SeqCst));
    assert!(disposable.is_disposed());
  }

  #[test]
  fn unhandled_error_does_not_panic() {
    let mut subscriber = LambdaSubscriber::<u32>::new(Box::new(|_| ()), None, None);
    subscriber.on_subscribe(EmptySubscription::shared());
    subscriber.on_error(FluxError::Custom("nobody listens".into()));
  }
}
