use std::mem;
use std::sync::Arc;

use crate::emitter::Emitter;
use crate::error::FluxError;
use crate::source::{Single, Source};
use crate::subscription::{
  fail_immediately, BoxSubscriber, Subscriber, Subscription, SubscriptionRef, UNBOUNDED
};


///////////////////////////////////////////////////////////////////////////////////////////////////
// BUFFER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source gathering the items of its upstream into batches.
///
/// Every batch holds exactly `size` items, except the last one which holds what remains
/// when the upstream completes. An empty upstream yields no batch.
pub struct Buffer<S> {
  upstream: S,
  size    : usize
}

impl<S> Buffer<S> {
  pub(crate) fn new(upstream: S, size: usize) -> Self {
    Buffer { upstream, size }
  }
}

impl<S> Source for Buffer<S>
where
  S: Source
{
  type Item = Vec<S::Item>;

  fn subscribe(&self, subscriber: BoxSubscriber<Self::Item>) {
    self.upstream.subscribe(Box::new(BufferSubscriber {
      downstream: subscriber,
      size      : self.size,
      batch     : Vec::with_capacity(self.size),
      rejected  : false
    }));
  }
}


struct BufferSubscriber<T> {
  downstream: BoxSubscriber<Vec<T>>,
  size      : usize,
  batch     : Vec<T>,
  rejected  : bool
}

impl<T> Subscriber<T> for BufferSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.size == 0 {
      subscription.cancel();
      self.rejected = true;
      fail_immediately(&mut self.downstream, FluxError::protocol("buffer size must be at least one"));
      return;
    }
    self.downstream.on_subscribe(Arc::new(BatchDemand { upstream: subscription, size: self.size as u64 }));
  }

  fn on_next(&mut self, value: T) {
    if self.rejected {
      return;
    }
    self.batch.push(value);
    if self.batch.len() == self.size {
      let batch = mem::replace(&mut self.batch, Vec::with_capacity(self.size));
      self.downstream.on_next(batch);
    }
  }

  fn on_error(&mut self, error: FluxError) {
    if !self.rejected {
      self.batch.clear();
      self.downstream.on_error(error);
    }
  }

  fn on_complete(&mut self) {
    if self.rejected {
      return;
    }
    if !self.batch.is_empty() {
      let batch = mem::take(&mut self.batch);
      self.downstream.on_next(batch);
    }
    self.downstream.on_complete();
  }
}


/// Turns a demand of `n` batches into a demand of `n * size` items.
struct BatchDemand {
  upstream: SubscriptionRef,
  size    : u64
}

impl Subscription for BatchDemand {
  fn request(&self, n: u64) {
    let items = if n == UNBOUNDED { UNBOUNDED } else { n.saturating_mul(self.size) };
    self.upstream.request(items);
  }

  fn cancel(&self) {
    self.upstream.cancel();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// COLLECT LIST
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A single gathering every item of its upstream into one list.
pub struct CollectList<S> {
  upstream: S
}

impl<S> CollectList<S> {
  pub(crate) fn new(upstream: S) -> Self {
    CollectList { upstream }
  }
}

impl<S> Source for CollectList<S>
where
  S: Source
{
  type Item = Vec<S::Item>;

  fn subscribe(&self, subscriber: BoxSubscriber<Self::Item>) {
    self.upstream.subscribe(Box::new(CollectSubscriber {
      emitter: Arc::new(Emitter::new(subscriber)),
      items  : Vec::new()
    }));
  }
}

impl<S> Single for CollectList<S> where S: Source {}


struct CollectSubscriber<T> {
  emitter: Arc<Emitter<Vec<T>>>,
  items  : Vec<T>
}

impl<T> Subscriber<T> for CollectSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.emitter.start(Arc::new(CollectSubscription {
      emitter : self.emitter.clone(),
      upstream: subscription.clone()
    }));
    subscription.request(UNBOUNDED);
  }

  fn on_next(&mut self, value: T) {
    self.items.push(value);
  }

  fn on_error(&mut self, error: FluxError) {
    self.items.clear();
    self.emitter.error(error);
  }

  fn on_complete(&mut self) {
    self.emitter.next(mem::take(&mut self.items));
    self.emitter.complete();
  }
}


struct CollectSubscription<T> {
  emitter : Arc<Emitter<Vec<T>>>,
  upstream: SubscriptionRef
}

impl<T> Subscription for CollectSubscription<T>
where
  T: Send + 'static
{
  fn request(&self, n: u64) {
    if !self.emitter.request(n) {
      self.upstream.cancel();
    }
  }

  fn cancel(&self) {
    self.emitter.cancel();
    self.upstream.cancel();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use crate::error::FluxError;
  use crate::source::{Single, Source};
  use crate::sources;
  use crate::verifier::StepVerifier;

  const FRUITS: [&str; 5] = ["apple", "orange", "banana", "kiwi", "strawberry"];

  #[test]
  fn buffer_emits_a_partial_last_batch() {
    StepVerifier::create(sources::from_array(FRUITS).buffer(3))
      .expect_next(vec!["apple", "orange", "banana"])
      .expect_next(vec!["kiwi", "strawberry"])
      .verify_complete();
  }

  #[test]
  fn buffer_scales_demand() {
    StepVerifier::create_with_demand(sources::range(0, 6).buffer(2), 1)
      .expect_next(vec![0, 1])
      .then_request(2)
      .expect_next(vec![2, 3])
      .expect_next(vec![4, 5])
      .verify_complete();
  }

  #[test]
  fn buffer_of_nothing_is_empty() {
    StepVerifier::create(sources::empty::<u8>().buffer(3)).verify_complete();
    StepVerifier::create(sources::range(0, 3).buffer(0))
      .expect_error_matches(|error| matches!(error, FluxError::ProtocolViolation(_)))
      .verify();
  }

  #[test]
  fn collect_list_waits_for_demand() {
    StepVerifier::create_with_demand(sources::from_array(FRUITS).collect_list(), 0)
      .expect_no_event(std::time::Duration::from_millis(20))
      .then_request(1)
      .expect_next(FRUITS.to_vec())
      .verify_complete();

    assert_eq!(sources::empty::<u8>().collect_list().block(), Ok(Some(Vec::new())));
  }
}
