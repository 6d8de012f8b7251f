use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::FluxError;
use crate::scheduler::{SchedulerRef, WorkerRef};
use crate::source::{Single, Source};
use crate::subscription::{
  BoxSubscriber, DeferredSubscription, Subscriber, Subscription, SubscriptionRef
};


///////////////////////////////////////////////////////////////////////////////////////////////////
// DEFERRED SUBSCRIBE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Hands `handle` to `downstream` right away, then subscribes it to `upstream` from a task
/// run on `worker` after `delay`. The upstream subscription is attached to `deferred`.
pub(crate) fn subscribe_later<S>(
  upstream  : Arc<S>,
  downstream: BoxSubscriber<S::Item>,
  handle    : SubscriptionRef,
  deferred  : Arc<DeferredSubscription>,
  worker    : WorkerRef,
  delay     : Duration
)
where
  S: Source + ?Sized
{
  let mut downstream = downstream;
  downstream.on_subscribe(handle);

  let slot = Arc::new(Mutex::new(Some(downstream)));
  let task_slot = slot.clone();
  let task = Box::new(move || {
    let Some(downstream) = task_slot.lock().take() else { return };
    if deferred.is_cancelled() {
      debug!("cancelled before the upstream was subscribed");
      return;
    }
    upstream.subscribe(Box::new(DeferredSubscriber { downstream, deferred }));
  });

  if let Err(error) = worker.schedule(task, delay) {
    warn!(%error, "could not schedule the upstream subscription");
    let downstream = slot.lock().take();
    if let Some(mut downstream) = downstream {
      downstream.on_error(error);
    }
  }
}


/// Forwards every signal but `on_subscribe`, whose subscription is attached to a
/// `DeferredSubscription` the downstream already holds.
struct DeferredSubscriber<T> {
  downstream: BoxSubscriber<T>,
  deferred  : Arc<DeferredSubscription>
}

impl<T> Subscriber<T> for DeferredSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.deferred.set(subscription);
  }

  fn on_next(&mut self, value: T) {
    self.downstream.on_next(value);
  }

  fn on_error(&mut self, error: FluxError) {
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    self.downstream.on_complete();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SUBSCRIBE ON
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source subscribing to its upstream, and forwarding every request to it, from a worker
/// of a given scheduler. The upstream thus produces on that worker.
pub struct SubscribeOn<S> {
  upstream : Arc<S>,
  scheduler: SchedulerRef
}

impl<S> SubscribeOn<S> {
  pub(crate) fn new(upstream: S, scheduler: SchedulerRef) -> Self {
    SubscribeOn { upstream: Arc::new(upstream), scheduler }
  }
}

impl<S> Source for SubscribeOn<S>
where
  S: Source
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    let worker = self.scheduler.create_worker();
    let deferred = Arc::new(DeferredSubscription::new());
    let handle = Arc::new(OnWorker { deferred: deferred.clone(), worker: worker.clone() });
    subscribe_later(self.upstream.clone(), subscriber, handle, deferred, worker, Duration::ZERO);
  }
}

impl<S> Single for SubscribeOn<S> where S: Single {}


/// Moves every request onto the worker the upstream runs on.
struct OnWorker {
  deferred: Arc<DeferredSubscription>,
  worker  : WorkerRef
}

impl Subscription for OnWorker {
  fn request(&self, n: u64) {
    let deferred = self.deferred.clone();
    if let Err(error) = self.worker.schedule(Box::new(move || deferred.request(n)), Duration::ZERO) {
      debug!(%error, "request dropped by a released worker");
    }
  }

  fn cancel(&self) {
    self.deferred.cancel();
    self.worker.dispose();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
