use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::emitter::Emitter;
use crate::error::FluxError;
use crate::operators::schedule::subscribe_later;
use crate::scheduler::{SchedulerRef, WorkerRef};
use crate::source::{Single, Source};
use crate::subscription::{
  BoxSubscriber, DeferredSubscription, Subscriber, Subscription, SubscriptionRef
};


///////////////////////////////////////////////////////////////////////////////////////////////////
// DELAY ELEMENTS
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source emitting every item of its upstream a fixed delay after it was produced.
///
/// One item is in flight at a time: the next one is requested from the upstream once the
/// previous one has been emitted and the downstream still has demand for it, so a synchronous
/// upstream is spread over `delay`, `2 * delay`, and so on. Completion waits for the item in
/// flight; errors are forwarded at once.
pub struct DelayElements<S> {
  upstream : S,
  delay    : Duration,
  scheduler: SchedulerRef
}

impl<S> DelayElements<S> {
  pub(crate) fn new(upstream: S, delay: Duration, scheduler: SchedulerRef) -> Self {
    DelayElements { upstream, delay, scheduler }
  }
}

impl<S> Source for DelayElements<S>
where
  S: Source
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    let delayer = Arc::new(Delayer {
      emitter : Emitter::new(subscriber),
      upstream: Mutex::new(None),
      worker  : self.scheduler.create_worker(),
      delay   : self.delay,
      phase   : Mutex::new(Phase::default())
    });
    self.upstream.subscribe(Box::new(DelaySubscriber { delayer }));
  }
}

impl<S> Single for DelayElements<S> where S: Single {}


#[derive(Default)]
struct Phase {
  requested    : bool,
  in_flight    : bool,
  upstream_done: bool
}

struct Delayer<T> {
  emitter : Emitter<T>,
  upstream: Mutex<Option<SubscriptionRef>>,
  worker  : WorkerRef,
  delay   : Duration,
  phase   : Mutex<Phase>
}

impl<T> Delayer<T>
where
  T: Send + 'static
{
  /// Requests the next upstream item, unless one is already on its way or the downstream
  /// has no use for it yet.
  fn pull(&self) {
    {
      let mut phase = self.phase.lock();
      if phase.requested || phase.in_flight || phase.upstream_done || !self.emitter.has_room() {
        return;
      }
      phase.requested = true;
    }

    let upstream = self.upstream.lock().clone();
    if let Some(upstream) = upstream {
      upstream.request(1);
    }
  }

  fn emit(&self, value: T) {
    self.emitter.next(value);

    let completed = {
      let mut phase = self.phase.lock();
      phase.in_flight = false;
      phase.upstream_done
    };
    if completed {
      self.worker.dispose();
      self.emitter.complete();
    }
    else {
      self.pull();
    }
  }

  fn release(&self) {
    self.worker.dispose();
    let upstream = self.upstream.lock().take();
    if let Some(upstream) = upstream {
      upstream.cancel();
    }
  }
}


struct DelaySubscriber<T> {
  delayer: Arc<Delayer<T>>
}

impl<T> Subscriber<T> for DelaySubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    *self.delayer.upstream.lock() = Some(subscription);
    self.delayer.emitter.start(Arc::new(DelayedSubscription { delayer: self.delayer.clone() }));
    self.delayer.pull();
  }

  fn on_next(&mut self, value: T) {
    {
      let mut phase = self.delayer.phase.lock();
      phase.requested = false;
      phase.in_flight = true;
    }

    let delayer = self.delayer.clone();
    let scheduled = self.delayer.worker.schedule(Box::new(move || delayer.emit(value)), self.delayer.delay);
    if let Err(error) = scheduled {
      self.delayer.release();
      self.delayer.emitter.error(error);
    }
  }

  fn on_error(&mut self, error: FluxError) {
    self.delayer.worker.dispose();
    self.delayer.emitter.error(error);
  }

  fn on_complete(&mut self) {
    let idle = {
      let mut phase = self.delayer.phase.lock();
      phase.upstream_done = true;
      !phase.in_flight
    };
    if idle {
      self.delayer.worker.dispose();
      self.delayer.emitter.complete();
    }
  }
}


struct DelayedSubscription<T> {
  delayer: Arc<Delayer<T>>
}

impl<T> Subscription for DelayedSubscription<T>
where
  T: Send + 'static
{
  fn request(&self, n: u64) {
    if self.delayer.emitter.request(n) {
      self.delayer.pull();
    }
    else {
      self.delayer.release();
    }
  }

  fn cancel(&self) {
    self.delayer.emitter.cancel();
    self.delayer.release();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// DELAY SUBSCRIPTION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source subscribing to its upstream only once a delay has elapsed.
pub struct DelaySubscription<S> {
  upstream : Arc<S>,
  delay    : Duration,
  scheduler: SchedulerRef
}

impl<S> DelaySubscription<S> {
  pub(crate) fn new(upstream: S, delay: Duration, scheduler: SchedulerRef) -> Self {
    DelaySubscription { upstream: Arc::new(upstream), delay, scheduler }
  }
}

impl<S> Source for DelaySubscription<S>
where
  S: Source
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    let deferred = Arc::new(DeferredSubscription::new());
    let worker = self.scheduler.create_worker();
    subscribe_later(self.upstream.clone(), subscriber, deferred.clone(), deferred, worker, self.delay);
  }
}

impl<S> Single for DelaySubscription<S> where S: Single {}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
