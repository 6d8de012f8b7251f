use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};

use crate::combinators::{self, Merge, Zip};
use crate::error::{BoxError, FluxError};
use crate::operators::buffer::{Buffer, CollectList};
use crate::operators::flat_map::FlatMap;
use crate::operators::limit::{Skip, SkipFor, Take, TakeFor};
use crate::operators::log::Log;
use crate::operators::retry::Retry;
use crate::operators::schedule::SubscribeOn;
use crate::operators::time::{DelayElements, DelaySubscription};
use crate::operators::transform::{Distinct, Filter, Map, TryMap};
use crate::scheduler::{self, SchedulerRef};
use crate::subscribers::{Disposable, LambdaSubscriber, StrictSubscriber};
use crate::subscription::{BoxSubscriber, Signal, Subscriber, SubscriptionRef, UNBOUNDED};


///////////////////////////////////////////////////////////////////////////////////////////////////
// SOURCE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A lazy, cold description of a sequence of items.
pub trait Source: Send + Sync + 'static {
  /// The type of the items produced by the source.
  type Item: Send + 'static;

  /// Starts a new, independent run of the source, delivering its signals to `subscriber`.
  ///
  /// Nothing flows before the subscriber requests items through the subscription it
  /// receives in `on_subscribe`.
  fn subscribe(&self, subscriber: BoxSubscriber<Self::Item>);

  /// Erases the type of the source.
  fn boxed(self) -> BoxSource<Self::Item>
  where
    Self: Sized
  {
    Arc::new(self)
  }

  /// Subscribes with unbounded demand, calling `on_next` for each item.
  ///
  /// Errors are logged, since there is no handler for them.
  fn subscribe_with<N>(&self, on_next: N) -> Disposable
  where
    Self: Sized,
    N: FnMut(Self::Item) + Send + 'static
  {
    subscribe_lambda(self, LambdaSubscriber::new(Box::new(on_next), None, None))
  }

  /// Subscribes with unbounded demand and a handler for each kind of signal.
  fn subscribe_all<N, E, C>(&self, on_next: N, on_error: E, on_complete: C) -> Disposable
  where
    Self: Sized,
    N: FnMut(Self::Item) + Send + 'static,
    E: FnMut(FluxError) + Send + 'static,
    C: FnOnce() + Send + 'static
  {
    let subscriber = LambdaSubscriber::new(
      Box::new(on_next),
      Some(Box::new(on_error)),
      Some(Box::new(on_complete))
    );
    subscribe_lambda(self, subscriber)
  }

  // Transformations

  /// Applies `function` to every item.
  fn map<F, U>(self, function: F) -> Map<Self, F>
  where
    Self: Sized,
    F: Fn(Self::Item) -> U + Send + Sync + 'static,
    U: Send + 'static
  {
    Map::new(self, function)
  }

  /// Applies a fallible `function` to every item; the first failure cancels the upstream
  /// and is delivered as `FluxError::UserFunction`.
  fn try_map<F, U, E>(self, function: F) -> TryMap<Self, F>
  where
    Self: Sized,
    F: Fn(Self::Item) -> Result<U, E> + Send + Sync + 'static,
    E: Into<BoxError> + 'static,
    U: Send + 'static
  {
    TryMap::new(self, function)
  }

  /// Keeps the items satisfying `predicate`.
  fn filter<P>(self, predicate: P) -> Filter<Self, P>
  where
    Self: Sized,
    P: Fn(&Self::Item) -> bool + Send + Sync + 'static
  {
    Filter::new(self, predicate)
  }

  /// Drops the items equal to one seen before.
  fn distinct(self) -> Distinct<Self>
  where
    Self: Sized,
    Self::Item: Eq + Hash + Clone
  {
    Distinct::new(self)
  }

  /// Subscribes to the source returned by `function` for every item, merging their items.
  fn flat_map<F, R>(self, function: F) -> FlatMap<Self, F>
  where
    Self: Sized,
    F: Fn(Self::Item) -> R + Send + Sync + 'static,
    R: Source
  {
    FlatMap::new(self, function)
  }

  // Limits

  /// Drops the first `count` items.
  fn skip(self, count: u64) -> Skip<Self>
  where
    Self: Sized
  {
    Skip::new(self, count)
  }

  /// Drops the items arriving before `duration` has elapsed since subscription.
  fn skip_for(self, duration: Duration) -> SkipFor<Self>
  where
    Self: Sized
  {
    self.skip_for_on(duration, scheduler::default_timer())
  }

  /// `skip_for`, timed against the clock of `scheduler`.
  fn skip_for_on(self, duration: Duration, scheduler: SchedulerRef) -> SkipFor<Self>
  where
    Self: Sized
  {
    SkipFor::new(self, duration, scheduler)
  }

  /// Forwards the first `count` items, then cancels the upstream and completes.
  fn take(self, count: u64) -> Take<Self>
  where
    Self: Sized
  {
    Take::new(self, count)
  }

  /// Forwards items until `duration` has elapsed since subscription, then cancels the
  /// upstream and completes.
  fn take_for(self, duration: Duration) -> TakeFor<Self>
  where
    Self: Sized
  {
    self.take_for_on(duration, scheduler::default_timer())
  }

  /// `take_for`, timed by `scheduler`.
  fn take_for_on(self, duration: Duration, scheduler: SchedulerRef) -> TakeFor<Self>
  where
    Self: Sized
  {
    TakeFor::new(self, duration, scheduler)
  }

  // Aggregation

  /// Gathers items into batches of `size`, the last one possibly smaller.
  fn buffer(self, size: usize) -> Buffer<Self>
  where
    Self: Sized
  {
    Buffer::new(self, size)
  }

  /// Gathers every item into one list, emitted once the upstream completes.
  fn collect_list(self) -> CollectList<Self>
  where
    Self: Sized
  {
    CollectList::new(self)
  }

  // Time and scheduling

  /// Emits every item `delay` after it was produced.
  fn delay_elements(self, delay: Duration) -> DelayElements<Self>
  where
    Self: Sized
  {
    self.delay_elements_on(delay, scheduler::default_timer())
  }

  /// `delay_elements`, timed by `scheduler`.
  fn delay_elements_on(self, delay: Duration, scheduler: SchedulerRef) -> DelayElements<Self>
  where
    Self: Sized
  {
    DelayElements::new(self, delay, scheduler)
  }

  /// Subscribes to the upstream `delay` after being subscribed to.
  fn delay_subscription(self, delay: Duration) -> DelaySubscription<Self>
  where
    Self: Sized
  {
    self.delay_subscription_on(delay, scheduler::default_timer())
  }

  /// `delay_subscription`, timed by `scheduler`.
  fn delay_subscription_on(self, delay: Duration, scheduler: SchedulerRef) -> DelaySubscription<Self>
  where
    Self: Sized
  {
    DelaySubscription::new(self, delay, scheduler)
  }

  /// Subscribes to the upstream, and requests from it, on a worker of `scheduler`.
  fn subscribe_on(self, scheduler: SchedulerRef) -> SubscribeOn<Self>
  where
    Self: Sized
  {
    SubscribeOn::new(self, scheduler)
  }

  // Combination and recovery

  /// Merges the items of this source and `other`, in arrival order.
  fn merge_with<O>(self, other: O) -> Merge<Self::Item>
  where
    Self: Sized,
    O: Source<Item = Self::Item>
  {
    combinators::merge(vec![self.boxed(), other.boxed()])
  }

  /// Pairs the items of this source and `other` by index.
  fn zip<O>(self, other: O) -> Zip<Self, O, fn(Self::Item, O::Item) -> (Self::Item, O::Item)>
  where
    Self: Sized,
    O: Source
  {
    combinators::zip(self, other)
  }

  /// Combines the items of this source and `other` by index with `combiner`.
  fn zip_with<O, F, R>(self, other: O, combiner: F) -> Zip<Self, O, F>
  where
    Self: Sized,
    O: Source,
    F: Fn(Self::Item, O::Item) -> R + Send + Sync + 'static,
    R: Send + 'static
  {
    combinators::zip_with(self, other, combiner)
  }

  /// Re-subscribes to the upstream after an error, at most `times` times.
  fn retry(self, times: u64) -> Retry<Self>
  where
    Self: Sized
  {
    Retry::new(self, times)
  }

  /// Records every signal going through as a `tracing` event tagged with `category`.
  fn log(self, category: &'static str) -> Log<Self>
  where
    Self: Sized,
    Self::Item: Debug
  {
    Log::new(self, category)
  }
}

fn subscribe_lambda<S>(source: &S, subscriber: LambdaSubscriber<S::Item>) -> Disposable
where
  S: Source + ?Sized
{
  let disposable = subscriber.disposable();
  let (strict, _violations) = StrictSubscriber::new(subscriber);
  source.subscribe(Box::new(strict));
  disposable
}

/// A type-erased, shareable source.
pub type BoxSource<T> = Arc<dyn Source<Item = T>>;

impl<S> Source for Arc<S>
where
  S: Source + ?Sized
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<Self::Item>) {
    (**self).subscribe(subscriber);
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SINGLE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source producing at most one item.
pub trait Single: Source {
  /// Subscribes and waits on the calling thread for the outcome: `Ok(Some(item))`,
  /// `Ok(None)` when the source completes empty, or the error it failed with.
  ///
  /// Must not be called from a worker the source itself runs on.
  fn block(&self) -> Result<Option<Self::Item>, FluxError> {
    let (sender, receiver) = unbounded();
    self.subscribe(Box::new(BlockingSubscriber { sender }));

    let mut value = None;
    loop {
      match receiver.recv() {
        Ok(Signal::Next(item)) => value = Some(item),
        Ok(Signal::Complete) => return Ok(value),
        Ok(Signal::Error(error)) => return Err(error),
        Err(_) => return Err(FluxError::protocol("source released its subscriber without terminating"))
      }
    }
  }
}

impl<S> Single for Arc<S> where S: Single + ?Sized {}


struct BlockingSubscriber<T> {
  sender: Sender<Signal<T>>
}

impl<T> Subscriber<T> for BlockingSubscriber<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    subscription.request(UNBOUNDED);
  }

  fn on_next(&mut self, value: T) {
    let _ = self.sender.send(Signal::Next(value));
  }

  fn on_error(&mut self, error: FluxError) {
    let _ = self.sender.send(Signal::Error(error));
  }

  fn on_complete(&mut self) {
    let _ = self.sender.send(Signal::Complete);
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use parking_lot::Mutex;

  use super::*;
  use crate::sources;

  #[test]
  fn sources_are_cold() {
    let numbers = sources::from_array([1, 2, 3]).map(|n| n * 10);
    let seen = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..2 {
      let seen = seen.clone();
      numbers.subscribe_with(move |n| seen.lock().push(n));
    }

    assert_eq!(*seen.lock(), vec![10, 20, 30, 10, 20, 30]);
  }

  #[test]
  fn subscribe_all_reports_completion() {
    let completed = Arc::new(Mutex::new(false));
    let flag = completed.clone();

    sources::range(0, 3).subscribe_all(|_| (), |error| panic!("unexpected {error}"), move || *flag.lock() = true);
    assert!(*completed.lock());
  }

  #[test]
  fn dispose_stops_delivery() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let copy = seen.clone();
    let scheduler = Arc::new(crate::scheduler::VirtualTimeScheduler::new());

    let disposable = sources::interval_on(Duration::from_secs(1), scheduler.clone())
      .subscribe_with(move |tick| copy.lock().push(tick));
    scheduler.advance_time_by(Duration::from_secs(2));
    disposable.dispose();
    scheduler.advance_time_by(Duration::from_secs(5));

    assert_eq!(*seen.lock(), vec![0, 1]);
  }

  #[test]
  fn block_returns_the_outcome_of_a_single() {
    assert_eq!(sources::just("Craig").map(str::to_uppercase).block(), Ok(Some("CRAIG".to_string())));
    assert_eq!(sources::single::empty::<u8>().block(), Ok(None));
    assert_eq!(
      sources::single::error::<u8>(FluxError::Custom("nope".into())).block(),
      Err(FluxError::Custom("nope".into()))
    );
  }

  #[test]
  fn boxed_sources_are_sources() {
    let boxed: BoxSource<u32> = sources::from_array([4, 5]).boxed();
    let collected = boxed.collect_list().block();
    assert_eq!(collected, Ok(Some(vec![4, 5])));
  }
}
