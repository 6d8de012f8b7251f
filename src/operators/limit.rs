use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::ClockRef;
use crate::emitter::Emitter;
use crate::error::FluxError;
use crate::scheduler::{SchedulerRef, WorkerRef};
use crate::source::Source;
use crate::subscription::{complete_empty, BoxSubscriber, Subscriber, Subscription, SubscriptionRef};


///////////////////////////////////////////////////////////////////////////////////////////////////
// SKIP
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source dropping the first items of its upstream.
pub struct Skip<S> {
  upstream: S,
  count   : u64
}

impl<S> Skip<S> {
  pub(crate) fn new(upstream: S, count: u64) -> Self {
    Skip { upstream, count }
  }
}

impl<S> Source for Skip<S>
where
  S: Source
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    self.upstream.subscribe(Box::new(SkipSubscriber {
      downstream: subscriber,
      upstream  : None,
      remaining : self.count
    }));
  }
}


struct SkipSubscriber<T> {
  downstream: BoxSubscriber<T>,
  upstream  : Option<SubscriptionRef>,
  remaining : u64
}

impl<T> Subscriber<T> for SkipSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, value: T) {
    if self.remaining == 0 {
      self.downstream.on_next(value);
      return;
    }
    self.remaining -= 1;
    if let Some(upstream) = &self.upstream {
      upstream.request(1);
    }
  }

  fn on_error(&mut self, error: FluxError) {
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    self.downstream.on_complete();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TAKE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source forwarding the first items of its upstream, then completing.
pub struct Take<S> {
  upstream: S,
  count   : u64
}

impl<S> Take<S> {
  pub(crate) fn new(upstream: S, count: u64) -> Self {
    Take { upstream, count }
  }
}

impl<S> Source for Take<S>
where
  S: Source
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    self.upstream.subscribe(Box::new(TakeSubscriber {
      downstream: subscriber,
      upstream  : None,
      remaining : self.count,
      done      : false
    }));
  }
}


struct TakeSubscriber<T> {
  downstream: BoxSubscriber<T>,
  upstream  : Option<SubscriptionRef>,
  remaining : u64,
  done      : bool
}

impl<T> TakeSubscriber<T> {
  fn finish(&mut self) {
    self.done = true;
    if let Some(upstream) = self.upstream.take() {
      upstream.cancel();
    }
  }
}

impl<T> Subscriber<T> for TakeSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.remaining == 0 {
      subscription.cancel();
      self.done = true;
      complete_empty(&mut self.downstream);
      return;
    }
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, value: T) {
    if self.done {
      return;
    }
    self.remaining -= 1;
    self.downstream.on_next(value);
    if self.remaining == 0 && !self.done {
      self.finish();
      self.downstream.on_complete();
    }
  }

  fn on_error(&mut self, error: FluxError) {
    if !self.done {
      self.done = true;
      self.downstream.on_error(error);
    }
  }

  fn on_complete(&mut self) {
    if !self.done {
      self.done = true;
      self.downstream.on_complete();
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SKIP FOR
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source dropping the items its upstream produces during a window opened at subscription.
pub struct SkipFor<S> {
  upstream : S,
  duration : Duration,
  scheduler: SchedulerRef
}

impl<S> SkipFor<S> {
  pub(crate) fn new(upstream: S, duration: Duration, scheduler: SchedulerRef) -> Self {
    SkipFor { upstream, duration, scheduler }
  }
}

impl<S> Source for SkipFor<S>
where
  S: Source
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    let clock = self.scheduler.clock();
    let open_at = clock.now() + self.duration;
    self.upstream.subscribe(Box::new(SkipForSubscriber {
      downstream: subscriber,
      upstream  : None,
      clock,
      open_at
    }));
  }
}


struct SkipForSubscriber<T> {
  downstream: BoxSubscriber<T>,
  upstream  : Option<SubscriptionRef>,
  clock     : ClockRef,
  open_at   : Duration
}

impl<T> Subscriber<T> for SkipForSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, value: T) {
    if self.clock.now() >= self.open_at {
      self.downstream.on_next(value);
    }
    else if let Some(upstream) = &self.upstream {
      upstream.request(1);
    }
  }

  fn on_error(&mut self, error: FluxError) {
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    self.downstream.on_complete();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TAKE FOR
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source forwarding the items of its upstream until a window opened at subscription closes.
///
/// The window is closed by a timer, or by the first item arriving at or after its end.
pub struct TakeFor<S> {
  upstream : S,
  duration : Duration,
  scheduler: SchedulerRef
}

impl<S> TakeFor<S> {
  pub(crate) fn new(upstream: S, duration: Duration, scheduler: SchedulerRef) -> Self {
    TakeFor { upstream, duration, scheduler }
  }
}

impl<S> Source for TakeFor<S>
where
  S: Source
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    let clock = self.scheduler.clock();
    let state = Arc::new(Window {
      emitter : Emitter::new(subscriber),
      upstream: Mutex::new(None),
      worker  : self.scheduler.create_worker(),
      closes  : clock.now() + self.duration,
      clock,
      closed  : AtomicBool::new(false)
    });
    self.upstream.subscribe(Box::new(WindowSubscriber { state }));
  }
}


struct Window<T> {
  emitter : Emitter<T>,
  upstream: Mutex<Option<SubscriptionRef>>,
  worker  : WorkerRef,
  clock   : ClockRef,
  closes  : Duration,
  closed  : AtomicBool
}

impl<T> Window<T>
where
  T: Send + 'static
{
  fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    debug!(at = ?self.clock.now(), "take window closed");
    self.release();
    self.emitter.complete();
  }

  fn release(&self) {
    self.worker.dispose();
    let upstream = self.upstream.lock().take();
    if let Some(upstream) = upstream {
      upstream.cancel();
    }
  }
}


struct WindowSubscriber<T> {
  state: Arc<Window<T>>
}

impl<T> Subscriber<T> for WindowSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    let state = &self.state;
    *state.upstream.lock() = Some(subscription);

    let timer = state.clone();
    let delay = state.closes.saturating_sub(state.clock.now());
    if let Err(error) = state.worker.schedule(Box::new(move || timer.close()), delay) {
      state.closed.store(true, Ordering::Release);
      state.release();
      state.emitter.error(error);
    }

    state.emitter.start(Arc::new(WindowSubscription { state: state.clone() }));
  }

  fn on_next(&mut self, value: T) {
    if self.state.closed.load(Ordering::Acquire) {
      return;
    }
    if self.state.clock.now() >= self.state.closes {
      self.state.close();
      return;
    }
    self.state.emitter.next(value);
  }

  fn on_error(&mut self, error: FluxError) {
    if !self.state.closed.swap(true, Ordering::AcqRel) {
      self.state.worker.dispose();
      self.state.emitter.error(error);
    }
  }

  fn on_complete(&mut self) {
    if !self.state.closed.swap(true, Ordering::AcqRel) {
      self.state.worker.dispose();
      self.state.emitter.complete();
    }
  }
}


struct WindowSubscription<T> {
  state: Arc<Window<T>>
}

impl<T> Subscription for WindowSubscription<T>
where
  T: Send + 'static
{
  fn request(&self, n: u64) {
    let accepted = self.state.emitter.request(n);
    let upstream = self.state.upstream.lock().clone();
    if let Some(upstream) = upstream {
      if accepted {
        upstream.request(n);
      }
      else {
        self.state.closed.store(true, Ordering::Release);
        self.state.release();
      }
    }
  }

  fn cancel(&self) {
    self.state.closed.store(true, Ordering::Release);
    self.state.emitter.cancel();
    self.state.release();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
