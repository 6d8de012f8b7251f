use std::iter::Peekable;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::FluxError;
use crate::source::{Single, Source};
use crate::subscription::{
  complete_empty, fail_immediately, BoxSubscriber, Demand, Subscription, WorkInProgress
};


///////////////////////////////////////////////////////////////////////////////////////////////////
// ITERATOR SUBSCRIPTION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Pulls items out of an iterator, as fast as the downstream demand allows.
///
/// The end of the iterator is looked ahead, so completion never waits for extra demand.
struct IterSubscription<I>
where
  I: Iterator
{
  downstream: Mutex<Option<BoxSubscriber<I::Item>>>,
  iterator  : Mutex<Option<Peekable<I>>>,
  demand    : Demand,
  wip       : WorkInProgress,
  cancelled : AtomicBool,
  violated  : AtomicBool
}

impl<I> IterSubscription<I>
where
  I: Iterator + Send + 'static,
  I::Item: Send + 'static
{
  fn start(iterator: I, downstream: BoxSubscriber<I::Item>) {
    let subscription = Arc::new(IterSubscription {
      downstream: Mutex::new(None),
      iterator  : Mutex::new(Some(iterator.peekable())),
      demand    : Demand::new(),
      wip       : WorkInProgress::held(),
      cancelled : AtomicBool::new(false),
      violated  : AtomicBool::new(false)
    });

    let mut downstream = downstream;
    downstream.on_subscribe(subscription.clone());
    *subscription.downstream.lock() = Some(downstream);
    subscription.wip.drain(|| subscription.deliver());
  }

  fn drain(&self) {
    if self.wip.enter() {
      self.wip.drain(|| self.deliver());
    }
  }

  fn deliver(&self) {
    let mut slot = self.downstream.lock();

    loop {
      if self.cancelled.load(Ordering::Acquire) {
        slot.take();
        self.iterator.lock().take();
        return;
      }

      let Some(downstream) = slot.as_mut() else { return };

      if self.violated.load(Ordering::Acquire) {
        self.iterator.lock().take();
        if let Some(mut downstream) = slot.take() {
          downstream.on_error(FluxError::protocol("request(n) requires n >= 1"));
        }
        return;
      }

      let next = {
        let mut iterator = self.iterator.lock();
        let Some(items) = iterator.as_mut() else { return };
        if items.peek().is_none() {
          None
        }
        else if self.demand.try_take() {
          items.next()
        }
        else {
          return;
        }
      };

      match next {
        Some(value) => downstream.on_next(value),
        None => {
          self.iterator.lock().take();
          if let Some(mut downstream) = slot.take() {
            downstream.on_complete();
          }
          return;
        }
      }
    }
  }
}

impl<I> Subscription for IterSubscription<I>
where
  I: Iterator + Send + 'static,
  I::Item: Send + 'static
{
  fn request(&self, n: u64) {
    if n == 0 {
      self.violated.store(true, Ordering::Release);
    }
    else {
      self.demand.add(n);
    }
    self.drain();
  }

  fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      debug!("iterator subscription cancelled");
    }
    self.drain();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// ITERABLE SOURCES
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Emits the items of a re-iterable collection, e.g. an array, a `Vec` or a range.
#[derive(Clone, Debug)]
pub struct FromIter<I> {
  iterable: I
}

impl<I> FromIter<I> {
  pub(crate) fn new(iterable: I) -> Self {
    FromIter { iterable }
  }
}

impl<I> Source for FromIter<I>
where
  I: IntoIterator + Clone + Send + Sync + 'static,
  I::IntoIter: Send + 'static,
  I::Item: Send + 'static
{
  type Item = I::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<Self::Item>) {
    IterSubscription::start(self.iterable.clone().into_iter(), subscriber);
  }
}


/// Emits consecutive integers; see `sources::range`.
#[derive(Clone, Debug)]
pub struct Range {
  span: Span
}

#[derive(Clone, Debug)]
enum Span {
  Empty,
  Values(RangeInclusive<i64>),
  Invalid(FluxError)
}

impl Range {
  pub(crate) fn new(start: i64, count: u64) -> Self {
    if count == 0 {
      return Range { span: Span::Empty };
    }

    let last = i64::try_from(count - 1).ok().and_then(|offset| start.checked_add(offset));
    let span = match last {
      Some(last) => Span::Values(start..=last),
      None => Span::Invalid(FluxError::InvalidArgument(
        format!("range of {count} integers from {start} runs past i64::MAX")
      ))
    };
    Range { span }
  }
}

impl Source for Range {
  type Item = i64;

  fn subscribe(&self, mut subscriber: BoxSubscriber<i64>) {
    match &self.span {
      Span::Empty => complete_empty(&mut subscriber),
      Span::Values(values) => IterSubscription::start(values.clone(), subscriber),
      Span::Invalid(error) => fail_immediately(&mut subscriber, error.clone())
    }
  }
}


/// Emits one item.
#[derive(Clone, Debug)]
pub struct Just<T> {
  value: T
}

impl<T> Just<T> {
  pub(crate) fn new(value: T) -> Self {
    Just { value }
  }
}

impl<T> Source for Just<T>
where
  T: Clone + Send + Sync + 'static
{
  type Item = T;

  fn subscribe(&self, subscriber: BoxSubscriber<T>) {
    IterSubscription::start(std::iter::once(self.value.clone()), subscriber);
  }
}

impl<T> Single for Just<T> where T: Clone + Send + Sync + 'static {}


/// Emits the items of a one-shot iterator; only the first subscriber gets them.
pub struct FromStream<I> {
  iterator: Mutex<Option<I>>
}

impl<I> FromStream<I> {
  pub(crate) fn new(iterator: I) -> Self {
    FromStream { iterator: Mutex::new(Some(iterator)) }
  }
}

impl<I> Source for FromStream<I>
where
  I: Iterator + Send + 'static,
  I::Item: Send + 'static
{
  type Item = I::Item;

  fn subscribe(&self, mut subscriber: BoxSubscriber<Self::Item>) {
    let iterator = self.iterator.lock().take();
    match iterator {
      Some(iterator) => IterSubscription::start(iterator, subscriber),
      None => fail_immediately(&mut subscriber, FluxError::SourceConsumed)
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;
  use crate::subscription::{Signal, Subscriber, SubscriptionRef};

  /// Requests `batch` items up front and each time a batch was fully received.
  struct Batching {
    batch       : u64,
    received    : u64,
    subscription: Option<SubscriptionRef>,
    signals     : Arc<Mutex<Vec<Signal<u32>>>>
  }

  impl Subscriber<u32> for Batching {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
      subscription.request(self.batch);
      self.subscription = Some(subscription);
    }

    fn on_next(&mut self, value: u32) {
      self.signals.lock().push(Signal::Next(value));
      self.received += 1;
      if self.received % self.batch == 0 {
        if let Some(subscription) = &self.subscription {
          subscription.request(self.batch);
        }
      }
    }

    fn on_error(&mut self, error: FluxError) {
      self.signals.lock().push(Signal::Error(error));
    }

    fn on_complete(&mut self) {
      self.signals.lock().push(Signal::Complete);
    }
  }

  fn batching(batch: u64) -> (BoxSubscriber<u32>, Arc<Mutex<Vec<Signal<u32>>>>) {
    let signals = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Batching { batch, received: 0, subscription: None, signals: signals.clone() };
    (Box::new(subscriber), signals)
  }

  #[test]
  fn reentrant_requests_keep_order() {
    let (subscriber, signals) = batching(2);
    FromIter::new(vec![1, 2, 3, 4, 5]).subscribe(subscriber);

    let expected: Vec<Signal<u32>> = (1..=5).map(Signal::Next).chain([Signal::Complete]).collect();
    assert_eq!(*signals.lock(), expected);
  }

  #[test]
  fn completion_does_not_wait_for_demand() {
    let (subscriber, signals) = batching(3);
    FromIter::new([7, 8, 9]).subscribe(subscriber);

    assert_eq!(*signals.lock(), vec![Signal::Next(7), Signal::Next(8), Signal::Next(9), Signal::Complete]);
  }

  #[test]
  fn from_stream_is_one_shot() {
    let source = FromStream::new(vec![1u32, 2].into_iter());

    let (first, first_signals) = batching(10);
    source.subscribe(first);
    assert_eq!(first_signals.lock().len(), 3);

    let (second, second_signals) = batching(10);
    source.subscribe(second);
    assert_eq!(*second_signals.lock(), vec![Signal::Error(FluxError::SourceConsumed)]);
  }
}
