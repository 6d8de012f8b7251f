use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::FluxError;
use crate::source::{Single, Source};
use crate::subscription::{BoxSubscriber, Subscriber, Subscription, SubscriptionRef, UNBOUNDED};


///////////////////////////////////////////////////////////////////////////////////////////////////
// RETRY
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source re-subscribing to its upstream when it fails, a bounded number of times.
///
/// Demand requested by the downstream and not yet fulfilled carries over to the new attempt.
pub struct Retry<S> {
  upstream: Arc<S>,
  times   : u64
}

impl<S> Retry<S> {
  pub(crate) fn new(upstream: S, times: u64) -> Self {
    Retry { upstream: Arc::new(upstream), times }
  }
}

impl<S> Source for Retry<S>
where
  S: Source
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    let attempts = Arc::new(Attempts {
      upstream: self.upstream.clone(),
      state   : Mutex::new(AttemptState::default())
    });

    let mut subscriber = subscriber;
    subscriber.on_subscribe(Arc::new(RetrySubscription { attempts: attempts.clone() }));
    self.upstream.subscribe(Box::new(AttemptSubscriber {
      downstream: Some(subscriber),
      attempts,
      attempt   : 0,
      remaining : self.times
    }));
  }
}

impl<S> Single for Retry<S> where S: Single {}


/// What survives from one attempt to the next.
#[derive(Default)]
struct AttemptState {
  current     : Option<SubscriptionRef>,
  outstanding : u64,
  zero_request: bool,
  cancelled   : bool
}

struct Attempts<S> {
  upstream: Arc<S>,
  state   : Mutex<AttemptState>
}

impl<S> Attempts<S> {
  /// Makes `subscription` the current attempt, handing it the outstanding demand.
  fn attach(&self, subscription: SubscriptionRef) {
    let (outstanding, zero_request, cancelled) = {
      let mut state = self.state.lock();
      state.current = Some(subscription.clone());
      (state.outstanding, state.zero_request, state.cancelled)
    };

    if cancelled {
      subscription.cancel();
      return;
    }
    if zero_request {
      subscription.request(0);
    }
    if outstanding > 0 {
      subscription.request(outstanding);
    }
  }

  fn delivered(&self) {
    let mut state = self.state.lock();
    if state.outstanding != UNBOUNDED {
      state.outstanding = state.outstanding.saturating_sub(1);
    }
  }

  fn is_cancelled(&self) -> bool {
    self.state.lock().cancelled
  }
}


struct RetrySubscription<S> {
  attempts: Arc<Attempts<S>>
}

impl<S> Subscription for RetrySubscription<S>
where
  S: Source
{
  fn request(&self, n: u64) {
    let current = {
      let mut state = self.attempts.state.lock();
      if n == 0 {
        state.zero_request = true;
      }
      state.outstanding = if n == UNBOUNDED { UNBOUNDED } else { state.outstanding.saturating_add(n) };
      state.current.clone()
    };
    if let Some(current) = current {
      current.request(n);
    }
  }

  fn cancel(&self) {
    let current = {
      let mut state = self.attempts.state.lock();
      state.cancelled = true;
      state.current.take()
    };
    if let Some(current) = current {
      current.cancel();
    }
  }
}


struct AttemptSubscriber<S>
where
  S: Source
{
  downstream: Option<BoxSubscriber<S::Item>>,
  attempts  : Arc<Attempts<S>>,
  attempt   : u64,
  remaining : u64
}

impl<S> Subscriber<S::Item> for AttemptSubscriber<S>
where
  S: Source
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.attempts.attach(subscription);
  }

  fn on_next(&mut self, value: S::Item) {
    self.attempts.delivered();
    if let Some(downstream) = self.downstream.as_mut() {
      downstream.on_next(value);
    }
  }

  fn on_error(&mut self, error: FluxError) {
    let Some(mut downstream) = self.downstream.take() else { return };

    if self.remaining == 0 || self.attempts.is_cancelled() {
      downstream.on_error(error);
      return;
    }

    debug!(%error, attempt = self.attempt + 1, "re-subscribing after an error");
    self.attempts.upstream.subscribe(Box::new(AttemptSubscriber {
      downstream: Some(downstream),
      attempts  : self.attempts.clone(),
      attempt   : self.attempt + 1,
      remaining : self.remaining - 1
    }));
  }

  fn on_complete(&mut self) {
    if let Some(mut downstream) = self.downstream.take() {
      downstream.on_complete();
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
