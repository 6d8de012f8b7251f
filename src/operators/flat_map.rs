use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::emitter::Emitter;
use crate::error::FluxError;
use crate::source::Source;
use crate::subscription::{
  BoxSubscriber, CompositeSubscription, Subscriber, Subscription, SubscriptionRef, UNBOUNDED
};


///////////////////////////////////////////////////////////////////////////////////////////////////
// MERGER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The point where several sources are merged into one downstream subscriber.
///
/// Every input is requested unbounded; the emitter serializes their items and holds them
/// back until the downstream asks for them. The downstream completes once every input has
/// completed, and the first error cancels every input.
pub(crate) struct Merger<T> {
  emitter: Emitter<T>,
  active : AtomicUsize,
  inputs : CompositeSubscription
}

impl<T> Merger<T>
where
  T: Send + 'static
{
  /// Creates a merger expecting `inputs` inputs to complete, and starts its downstream.
  pub fn start(downstream: BoxSubscriber<T>, inputs: usize) -> Arc<Self> {
    let merger = Arc::new(Merger {
      emitter: Emitter::new(downstream),
      active : AtomicUsize::new(inputs),
      inputs : CompositeSubscription::new()
    });
    merger.emitter.start(Arc::new(MergedSubscription { merger: merger.clone() }));
    if inputs == 0 {
      merger.emitter.complete();
    }
    merger
  }

  /// A subscriber feeding this merger as one of its inputs.
  pub fn input(self: &Arc<Self>) -> BoxSubscriber<T> {
    Box::new(MergeInput { merger: self.clone() })
  }

  /// Expects one more input to complete.
  pub fn expect_input(&self) {
    self.active.fetch_add(1, Ordering::AcqRel);
  }

  pub fn attach(&self, subscription: SubscriptionRef) -> bool {
    self.inputs.attach(subscription)
  }

  pub fn input_completed(&self) {
    if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.emitter.complete();
    }
  }

  pub fn fail(&self, error: FluxError) {
    debug!(%error, "merged input failed, cancelling the others");
    self.emitter.error(error);
    self.inputs.release();
  }

  pub fn next(&self, value: T) {
    self.emitter.next(value);
  }
}


struct MergedSubscription<T> {
  merger: Arc<Merger<T>>
}

impl<T> Subscription for MergedSubscription<T>
where
  T: Send + 'static
{
  fn request(&self, n: u64) {
    if !self.merger.emitter.request(n) {
      self.merger.inputs.release();
    }
  }

  fn cancel(&self) {
    self.merger.emitter.cancel();
    self.merger.inputs.release();
  }
}


struct MergeInput<T> {
  merger: Arc<Merger<T>>
}

impl<T> Subscriber<T> for MergeInput<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.merger.attach(subscription.clone()) {
      subscription.request(UNBOUNDED);
    }
  }

  fn on_next(&mut self, value: T) {
    self.merger.next(value);
  }

  fn on_error(&mut self, error: FluxError) {
    self.merger.fail(error);
  }

  fn on_complete(&mut self) {
    self.merger.input_completed();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// FLAT MAP
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source mapping every item of its upstream to a source, and merging the items of all
/// those sources.
///
/// Items of distinct inner sources may interleave; the items of one inner source keep their
/// order. Completion waits for the upstream and every inner source.
pub struct FlatMap<S, F> {
  upstream: S,
  function: Arc<F>
}

impl<S, F> FlatMap<S, F> {
  pub(crate) fn new(upstream: S, function: F) -> Self {
    FlatMap { upstream, function: Arc::new(function) }
  }
}

impl<S, F, R> Source for FlatMap<S, F>
where
  S: Source,
  F: Fn(S::Item) -> R + Send + Sync + 'static,
  R: Source
{
  type Item = R::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<R::Item>) {
    let merger = Merger::start(subscriber, 1);
    self.upstream.subscribe(Box::new(OuterSubscriber {
      merger,
      function: self.function.clone()
    }));
  }
}


struct OuterSubscriber<U, F> {
  merger  : Arc<Merger<U>>,
  function: Arc<F>
}

impl<T, U, F, R> Subscriber<T> for OuterSubscriber<U, F>
where
  F: Fn(T) -> R + Send + Sync + 'static,
  R: Source<Item = U>,
  U: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.merger.attach(subscription.clone()) {
      subscription.request(UNBOUNDED);
    }
  }

  fn on_next(&mut self, value: T) {
    self.merger.expect_input();
    (self.function)(value).subscribe(self.merger.input());
  }

  fn on_error(&mut self, error: FluxError) {
    self.merger.fail(error);
  }

  fn on_complete(&mut self) {
    self.merger.input_completed();
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use crate::error::FluxError;
  use crate::scheduler;
  use crate::source::Source;
  use crate::sources;
  use crate::verifier::StepVerifier;

  const PLAYERS: [&str; 3] = ["Michael Jordan", "Scottie Pippen", "Steve Kerr"];

  #[test]
  fn flat_map_on_parallel_workers_emits_every_item() {
    let players = sources::from_array(PLAYERS)
      .flat_map(sources::just)
      .map(|name| {
        let (first, last) = name.split_once(' ').unwrap_or((name, ""));
        (first.to_string(), last.to_string())
      })
      .subscribe_on(scheduler::parallel());

    let known = |player: &(String, String)| PLAYERS.contains(&format!("{} {}", player.0, player.1).as_str());
    StepVerifier::create(players)
      .expect_next_matches(known)
      .expect_next_matches(known)
      .expect_next_matches(known)
      .verify_complete();
  }

  #[test]
  fn inner_sources_run_concurrently() {
    let fruits = sources::from_array(["apple", "orange", "banana", "kiwi", "strawberry"])
      .buffer(3)
      .flat_map(|batch| {
        sources::from_iter(batch)
          .map(str::to_uppercase)
          .subscribe_on(scheduler::parallel())
      })
      .collect_list();

    StepVerifier::create(fruits)
      .expect_next_matches(|all| {
        let mut all = all.clone();
        all.sort();
        all == ["APPLE", "BANANA", "KIWI", "ORANGE", "STRAWBERRY"]
      })
      .verify_complete();
  }

  #[test]
  fn first_inner_error_wins() {
    let failing = sources::range(0, 3).flat_map(|n| {
      if n == 1 {
        sources::error(FluxError::Custom("inner".into())).boxed()
      }
      else {
        sources::just(n).boxed()
      }
    });

    StepVerifier::create(failing)
      .expect_next(0)
      .expect_error_matches(|error| error.to_string() == "inner")
      .verify();
  }

  #[test]
  fn completion_waits_for_inner_sources() {
    StepVerifier::with_virtual_time(|| {
      sources::range(1, 2).flat_map(|n| sources::just(n).delay_elements(Duration::from_secs(n as u64)))
    })
      .expect_next(1)
      .expect_next(2)
      .verify_complete();
  }
}
