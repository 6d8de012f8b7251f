use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{BoxError, FluxError};
use crate::source::{Single, Source};
use crate::subscription::{BoxSubscriber, Subscriber, SubscriptionRef};


///////////////////////////////////////////////////////////////////////////////////////////////////
// MAP
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source applying a function to the items of its upstream.
pub struct Map<S, F> {
  upstream: S,
  function: Arc<F>
}

impl<S, F> Map<S, F> {
  pub(crate) fn new(upstream: S, function: F) -> Self {
    Map { upstream, function: Arc::new(function) }
  }
}

impl<S, F, U> Source for Map<S, F>
where
  S: Source,
  F: Fn(S::Item) -> U + Send + Sync + 'static,
  U: Send + 'static
{
  type Item = U;

  fn subscribe(&self, subscriber: BoxSubscriber<U>) {
    self.upstream.subscribe(Box::new(MapSubscriber {
      downstream: subscriber,
      function  : self.function.clone()
    }));
  }
}

impl<S, F, U> Single for Map<S, F>
where
  S: Single,
  F: Fn(S::Item) -> U + Send + Sync + 'static,
  U: Send + 'static
{}


struct MapSubscriber<U, F> {
  downstream: BoxSubscriber<U>,
  function  : Arc<F>
}

impl<T, U, F> Subscriber<T> for MapSubscriber<U, F>
where
  F: Fn(T) -> U + Send + Sync + 'static,
  U: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, value: T) {
    self.downstream.on_next((self.function)(value));
  }

  fn on_error(&mut self, error: FluxError) {
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    self.downstream.on_complete();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TRY MAP
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source applying a fallible function to the items of its upstream.
pub struct TryMap<S, F> {
  upstream: S,
  function: Arc<F>
}

impl<S, F> TryMap<S, F> {
  pub(crate) fn new(upstream: S, function: F) -> Self {
    TryMap { upstream, function: Arc::new(function) }
  }
}

impl<S, F, U, E> Source for TryMap<S, F>
where
  S: Source,
  F: Fn(S::Item) -> Result<U, E> + Send + Sync + 'static,
  E: Into<BoxError> + 'static,
  U: Send + 'static
{
  type Item = U;

  fn subscribe(&self, subscriber: BoxSubscriber<U>) {
    self.upstream.subscribe(Box::new(TryMapSubscriber {
      downstream: subscriber,
      function  : self.function.clone(),
      upstream  : None,
      failed    : false,
      error     : PhantomData
    }));
  }
}

impl<S, F, U, E> Single for TryMap<S, F>
where
  S: Single,
  F: Fn(S::Item) -> Result<U, E> + Send + Sync + 'static,
  E: Into<BoxError> + 'static,
  U: Send + 'static
{}


struct TryMapSubscriber<U, F, E> {
  downstream: BoxSubscriber<U>,
  function  : Arc<F>,
  upstream  : Option<SubscriptionRef>,
  failed    : bool,
  error     : PhantomData<fn() -> E>
}

impl<T, U, F, E> Subscriber<T> for TryMapSubscriber<U, F, E>
where
  F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
  E: Into<BoxError> + 'static,
  U: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, value: T) {
    if self.failed {
      return;
    }
    match (self.function)(value) {
      Ok(mapped) => self.downstream.on_next(mapped),
      Err(error) => {
        self.failed = true;
        if let Some(upstream) = self.upstream.take() {
          upstream.cancel();
        }
        self.downstream.on_error(FluxError::user(error));
      }
    }
  }

  fn on_error(&mut self, error: FluxError) {
    if !self.failed {
      self.downstream.on_error(error);
    }
  }

  fn on_complete(&mut self) {
    if !self.failed {
      self.downstream.on_complete();
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// FILTER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source keeping the items of its upstream which satisfy a predicate.
pub struct Filter<S, P> {
  upstream : S,
  predicate: Arc<P>
}

impl<S, P> Filter<S, P> {
  pub(crate) fn new(upstream: S, predicate: P) -> Self {
    Filter { upstream, predicate: Arc::new(predicate) }
  }
}

impl<S, P> Source for Filter<S, P>
where
  S: Source,
  P: Fn(&S::Item) -> bool + Send + Sync + 'static
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    self.upstream.subscribe(Box::new(FilterSubscriber {
      downstream: subscriber,
      upstream  : None,
      keep      : self.predicate.clone()
    }));
  }
}

impl<S, P> Single for Filter<S, P>
where
  S: Single,
  P: Fn(&S::Item) -> bool + Send + Sync + 'static
{}


/// Keeps the items for which `keep` holds, replenishing one unit of upstream demand
/// for every dropped item.
struct FilterSubscriber<T, P> {
  downstream: BoxSubscriber<T>,
  upstream  : Option<SubscriptionRef>,
  keep      : Arc<P>
}

impl<T, P> Subscriber<T> for FilterSubscriber<T, P>
where
  T: Send + 'static,
  P: Fn(&T) -> bool + Send + Sync + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, value: T) {
    if (self.keep)(&value) {
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
// DISTINCT
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source dropping the items of its upstream equal to an item seen before.
///
/// Seen items are remembered for the whole life of a subscription.
pub struct Distinct<S> {
  upstream: S
}

impl<S> Distinct<S> {
  pub(crate) fn new(upstream: S) -> Self {
    Distinct { upstream }
  }
}

impl<S> Source for Distinct<S>
where
  S: Source,
  S::Item: Eq + Hash + Clone
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let keep = move |item: &S::Item| seen.lock().insert(item.clone());
    self.upstream.subscribe(Box::new(FilterSubscriber {
      downstream: subscriber,
      upstream  : None,
      keep      : Arc::new(keep)
    }));
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
