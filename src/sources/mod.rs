use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::FluxError;
use crate::scheduler::{self, SchedulerRef};
use crate::source::{Single, Source};
use crate::subscription::{complete_empty, fail_immediately, BoxSubscriber, Subscription};

pub use self::interval::Interval;
pub use self::iter::{FromIter, FromStream, Just, Range};

/// Pull sources draining an iterator at the pace of the downstream demand.
pub mod iter;

/// The `interval` push source.
pub mod interval;


///////////////////////////////////////////////////////////////////////////////////////////////////
// CONSTRUCTORS
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source emitting `value`, then completing.
pub fn just<T>(value: T) -> Just<T>
where
  T: Clone + Send + Sync + 'static
{
  Just::new(value)
}

/// A source emitting the elements of `array` in order.
pub fn from_array<T, const N: usize>(array: [T; N]) -> FromIter<[T; N]>
where
  T: Clone + Send + Sync + 'static
{
  FromIter::new(array)
}

/// A source emitting the elements of a re-iterable collection in order.
pub fn from_iter<I>(iterable: I) -> FromIter<I>
where
  I: IntoIterator + Clone + Send + Sync + 'static,
  I::IntoIter: Send + 'static,
  I::Item: Send + 'static
{
  FromIter::new(iterable)
}

/// A source emitting the items of a one-shot iterator. A second subscription fails with
/// `FluxError::SourceConsumed`.
pub fn from_stream<I>(iterator: I) -> FromStream<I>
where
  I: Iterator + Send + 'static,
  I::Item: Send + 'static
{
  FromStream::new(iterator)
}

/// A source emitting `count` consecutive integers from `start`.
///
/// When the last integer would exceed `i64::MAX`, every subscriber fails with
/// `FluxError::InvalidArgument` instead.
pub fn range(start: i64, count: u64) -> Range {
  Range::new(start, count)
}

/// A source emitting 0, 1, 2, … every `period` on the default timer scheduler.
pub fn interval(period: Duration) -> Interval {
  interval_on(period, scheduler::default_timer())
}

/// `interval`, timed by `scheduler`.
pub fn interval_on(period: Duration, scheduler: SchedulerRef) -> Interval {
  Interval::new(period, scheduler)
}

/// A source completing without any item.
pub fn empty<T>() -> Empty<T> {
  Empty { item: PhantomData }
}

/// A source failing with `error` right away.
pub fn error<T>(error: FluxError) -> Failing<T> {
  Failing { error, item: PhantomData }
}

/// A source never signalling anything.
pub fn never<T>() -> Never<T> {
  Never { item: PhantomData }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TRIVIAL SOURCES
///////////////////////////////////////////////////////////////////////////////////////////////////

/// See `empty`.
pub struct Empty<T> {
  item: PhantomData<fn() -> T>
}

impl<T> Source for Empty<T>
where
  T: Send + 'static
{
  type Item = T;

  fn subscribe(&self, mut subscriber: BoxSubscriber<T>) {
    complete_empty(&mut subscriber);
  }
}

impl<T> Single for Empty<T> where T: Send + 'static {}


/// See `error`.
pub struct Failing<T> {
  error: FluxError,
  item : PhantomData<fn() -> T>
}

impl<T> Source for Failing<T>
where
  T: Send + 'static
{
  type Item = T;

  fn subscribe(&self, mut subscriber: BoxSubscriber<T>) {
    fail_immediately(&mut subscriber, self.error.clone());
  }
}

impl<T> Single for Failing<T> where T: Send + 'static {}


/// See `never`.
pub struct Never<T> {
  item: PhantomData<fn() -> T>
}

impl<T> Source for Never<T>
where
  T: Send + 'static
{
  type Item = T;

  fn subscribe(&self, subscriber: BoxSubscriber<T>) {
    let subscription = Arc::new(NeverSubscription {
      downstream: Mutex::new(None),
      cancelled : AtomicBool::new(false)
    });

    let mut subscriber = subscriber;
    subscriber.on_subscribe(subscription.clone());
    let mut downstream = subscription.downstream.lock();
    if !subscription.cancelled.load(Ordering::Acquire) {
      *downstream = Some(subscriber);
    }
  }
}

impl<T> Single for Never<T> where T: Send + 'static {}


/// Holds the subscriber of a `Never` source until it cancels.
struct NeverSubscription<T> {
  downstream: Mutex<Option<BoxSubscriber<T>>>,
  cancelled : AtomicBool
}

impl<T> Subscription for NeverSubscription<T>
where
  T: Send + 'static
{
  fn request(&self, n: u64) {
    if n == 0 {
      let downstream = self.downstream.lock().take();
      if let Some(mut downstream) = downstream {
        downstream.on_error(FluxError::protocol("request(n) requires n >= 1"));
      }
    }
  }

  fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
    let downstream = self.downstream.lock().take();
    drop(downstream);
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SINGLE CONSTRUCTORS
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Constructors of sources producing at most one item.
pub mod single {
  use super::*;

  /// A single emitting `value`.
  pub fn just<T>(value: T) -> Just<T>
  where
    T: Clone + Send + Sync + 'static
  {
    Just::new(value)
  }

  /// A single completing empty.
  pub fn empty<T>() -> Empty<T> {
    super::empty()
  }

  /// A single failing with `error`.
  pub fn error<T>(error: FluxError) -> Failing<T> {
    super::error(error)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
