use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::emitter::Emitter;
use crate::error::FluxError;
use crate::operators::flat_map::Merger;
use crate::source::{BoxSource, Source};
use crate::subscription::{
  BoxSubscriber, CompositeSubscription, Subscriber, Subscription, SubscriptionRef, UNBOUNDED
};


///////////////////////////////////////////////////////////////////////////////////////////////////
// MERGE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Merges the items of several sources, in the order they arrive.
///
/// Every source is subscribed at once. The result completes when all of them have completed,
/// and fails with the first error, cancelling the others.
pub fn merge<T>(sources: Vec<BoxSource<T>>) -> Merge<T>
where
  T: Send + 'static
{
  Merge { sources }
}

/// A source merging the items of several sources.
pub struct Merge<T> {
  sources: Vec<BoxSource<T>>
}

impl<T> Source for Merge<T>
where
  T: Send + 'static
{
  type Item = T;

  fn subscribe(&self, subscriber: BoxSubscriber<T>) {
    let merger = Merger::start(subscriber, self.sources.len());
    for source in &self.sources {
      source.subscribe(merger.input());
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// ZIP
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Pairs the items of two sources by index.
pub fn zip<A, B>(left: A, right: B) -> Zip<A, B, fn(A::Item, B::Item) -> (A::Item, B::Item)>
where
  A: Source,
  B: Source
{
  zip_with(left, right, pair as fn(A::Item, B::Item) -> (A::Item, B::Item))
}

/// Combines the items of two sources by index with `combiner`.
pub fn zip_with<A, B, F, R>(left: A, right: B, combiner: F) -> Zip<A, B, F>
where
  A: Source,
  B: Source,
  F: Fn(A::Item, B::Item) -> R + Send + Sync + 'static,
  R: Send + 'static
{
  Zip { left, right, combiner: Arc::new(combiner) }
}

fn pair<A, B>(left: A, right: B) -> (A, B) {
  (left, right)
}

/// A source combining the n-th items of two sources.
///
/// Both sources are requested unbounded; their items wait in per-side buffers until the other
/// side catches up. The result completes as soon as one side has completed and has no item
/// left to pair, cancelling the other.
pub struct Zip<A, B, F> {
  left    : A,
  right   : B,
  combiner: Arc<F>
}

impl<A, B, F, R> Source for Zip<A, B, F>
where
  A: Source,
  B: Source,
  F: Fn(A::Item, B::Item) -> R + Send + Sync + 'static,
  R: Send + 'static
{
  type Item = R;

  fn subscribe(&self, subscriber: BoxSubscriber<R>) {
    let zipper = Arc::new(Zipper {
      emitter : Emitter::new(subscriber),
      combiner: self.combiner.clone(),
      buffers : Mutex::new(Buffers::default()),
      inputs  : CompositeSubscription::new()
    });
    zipper.emitter.start(Arc::new(ZipSubscription { zipper: zipper.clone() }));

    self.left.subscribe(Box::new(LeftInput { zipper: zipper.clone() }));
    self.right.subscribe(Box::new(RightInput { zipper }));
  }
}


struct Buffers<A, B> {
  left      : VecDeque<A>,
  right     : VecDeque<B>,
  left_done : bool,
  right_done: bool,
  finished  : bool
}

impl<A, B> Default for Buffers<A, B> {
  fn default() -> Self {
    Buffers {
      left      : VecDeque::new(),
      right     : VecDeque::new(),
      left_done : false,
      right_done: false,
      finished  : false
    }
  }
}

impl<A, B> Buffers<A, B> {
  fn exhausted(&self) -> bool {
    (self.left_done && self.left.is_empty()) || (self.right_done && self.right.is_empty())
  }
}

struct Zipper<A, B, F, R> {
  emitter : Emitter<R>,
  combiner: Arc<F>,
  buffers : Mutex<Buffers<A, B>>,
  inputs  : CompositeSubscription
}

impl<A, B, F, R> Zipper<A, B, F, R>
where
  F: Fn(A, B) -> R,
  R: Send + 'static
{
  /// Emits every complete pair, then completes if one side ran dry. Pairs are built and
  /// emitted under the buffers' lock so they leave in index order.
  fn drain(&self, buffers: &mut Buffers<A, B>) {
    while !buffers.left.is_empty() && !buffers.right.is_empty() {
      if let (Some(left), Some(right)) = (buffers.left.pop_front(), buffers.right.pop_front()) {
        self.emitter.next((self.combiner)(left, right));
      }
    }

    if !buffers.finished && buffers.exhausted() {
      buffers.finished = true;
      buffers.left.clear();
      buffers.right.clear();
      self.emitter.complete();
    }
  }

  fn update(&self, change: impl FnOnce(&mut Buffers<A, B>)) {
    let finished = {
      let mut buffers = self.buffers.lock();
      if buffers.finished {
        return;
      }
      change(&mut buffers);
      self.drain(&mut buffers);
      buffers.finished
    };
    if finished {
      self.inputs.release();
    }
  }

  fn fail(&self, error: FluxError) {
    {
      let mut buffers = self.buffers.lock();
      if buffers.finished {
        return;
      }
      buffers.finished = true;
      buffers.left.clear();
      buffers.right.clear();
    }
    debug!(%error, "zipped input failed, cancelling the other");
    self.emitter.error(error);
    self.inputs.release();
  }

  fn attach(&self, subscription: SubscriptionRef) {
    if self.inputs.attach(subscription.clone()) {
      subscription.request(UNBOUNDED);
    }
  }
}


struct ZipSubscription<A, B, F, R> {
  zipper: Arc<Zipper<A, B, F, R>>
}

impl<A, B, F, R> Subscription for ZipSubscription<A, B, F, R>
where
  A: Send + 'static,
  B: Send + 'static,
  F: Fn(A, B) -> R + Send + Sync + 'static,
  R: Send + 'static
{
  fn request(&self, n: u64) {
    if !self.zipper.emitter.request(n) {
      self.zipper.inputs.release();
    }
  }

  fn cancel(&self) {
    self.zipper.emitter.cancel();
    self.zipper.inputs.release();
  }
}


struct LeftInput<A, B, F, R> {
  zipper: Arc<Zipper<A, B, F, R>>
}

impl<A, B, F, R> Subscriber<A> for LeftInput<A, B, F, R>
where
  A: Send + 'static,
  B: Send + 'static,
  F: Fn(A, B) -> R + Send + Sync + 'static,
  R: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.zipper.attach(subscription);
  }

  fn on_next(&mut self, value: A) {
    self.zipper.update(|buffers| buffers.left.push_back(value));
  }

  fn on_error(&mut self, error: FluxError) {
    self.zipper.fail(error);
  }

  fn on_complete(&mut self) {
    self.zipper.update(|buffers| buffers.left_done = true);
  }
}


struct RightInput<A, B, F, R> {
  zipper: Arc<Zipper<A, B, F, R>>
}

impl<A, B, F, R> Subscriber<B> for RightInput<A, B, F, R>
where
  A: Send + 'static,
  B: Send + 'static,
  F: Fn(A, B) -> R + Send + Sync + 'static,
  R: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.zipper.attach(subscription);
  }

  fn on_next(&mut self, value: B) {
    self.zipper.update(|buffers| buffers.right.push_back(value));
  }

  fn on_error(&mut self, error: FluxError) {
    self.zipper.fail(error);
  }

  fn on_complete(&mut self) {
    self.zipper.update(|buffers| buffers.right_done = true);
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// FIRST
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Mirrors whichever source emits an item first, cancelling all the others.
///
/// An error raised before any source emitted fails the result. Sources completing empty
/// drop out of the race; when all of them did, the result completes empty.
pub fn first<T>(sources: Vec<BoxSource<T>>) -> First<T>
where
  T: Send + 'static
{
  First { sources }
}

/// A source mirroring the first of several sources to emit.
pub struct First<T> {
  sources: Vec<BoxSource<T>>
}

impl<T> Source for First<T>
where
  T: Send + 'static
{
  type Item = T;

  fn subscribe(&self, subscriber: BoxSubscriber<T>) {
    let race = Arc::new(Race {
      emitter : Emitter::new(subscriber),
      entrants: Mutex::new(vec![None; self.sources.len()]),
      winner  : Mutex::new(Winner::Undecided),
      running : AtomicUsize::new(self.sources.len())
    });
    race.emitter.start(Arc::new(RaceSubscription { race: race.clone() }));
    if self.sources.is_empty() {
      race.emitter.complete();
      return;
    }

    for (index, source) in self.sources.iter().enumerate() {
      source.subscribe(Box::new(Entrant { race: race.clone(), index }));
    }
  }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Winner {
  Undecided,
  Entrant(usize),
  /// The race ended without a winner (cancelled, failed or all empty).
  Nobody
}

struct Race<T> {
  emitter : Emitter<T>,
  entrants: Mutex<Vec<Option<SubscriptionRef>>>,
  winner  : Mutex<Winner>,
  running : AtomicUsize
}

impl<T> Race<T>
where
  T: Send + 'static
{
  fn enter(&self, index: usize, subscription: SubscriptionRef) {
    let open = {
      let winner = self.winner.lock();
      match *winner {
        Winner::Undecided => {
          self.entrants.lock()[index] = Some(subscription.clone());
          true
        },
        Winner::Entrant(winner) => winner == index,
        Winner::Nobody => false
      }
    };

    if open {
      subscription.request(UNBOUNDED);
    }
    else {
      subscription.cancel();
    }
  }

  /// Whether `index` may forward its signal, deciding the race in its favor if still open.
  fn claim(&self, index: usize) -> bool {
    let decided = {
      let mut winner = self.winner.lock();
      match *winner {
        Winner::Undecided => {
          *winner = Winner::Entrant(index);
          true
        },
        Winner::Entrant(current) => return current == index,
        Winner::Nobody => return false
      }
    };

    if decided {
      debug!(winner = index, "first source to emit wins");
      self.cancel_others(index);
    }
    decided
  }

  /// Ends the race without a winner.
  fn abandon(&self) -> bool {
    let mut winner = self.winner.lock();
    match *winner {
      Winner::Undecided => {
        *winner = Winner::Nobody;
        true
      },
      _ => false
    }
  }

  fn cancel_others(&self, keep: usize) {
    let losers: Vec<_> = self.entrants.lock()
      .iter_mut()
      .enumerate()
      .filter(|(index, _)| *index != keep)
      .filter_map(|(_, entrant)| entrant.take())
      .collect();
    for loser in losers {
      loser.cancel();
    }
  }

  fn cancel_all(&self) {
    let entrants: Vec<_> = self.entrants.lock().iter_mut().filter_map(Option::take).collect();
    for entrant in entrants {
      entrant.cancel();
    }
  }
}


struct RaceSubscription<T> {
  race: Arc<Race<T>>
}

impl<T> Subscription for RaceSubscription<T>
where
  T: Send + 'static
{
  fn request(&self, n: u64) {
    if !self.race.emitter.request(n) {
      self.race.abandon();
      self.race.cancel_all();
    }
  }

  fn cancel(&self) {
    self.race.emitter.cancel();
    self.race.abandon();
    self.race.cancel_all();
  }
}


struct Entrant<T> {
  race : Arc<Race<T>>,
  index: usize
}

impl<T> Subscriber<T> for Entrant<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.race.enter(self.index, subscription);
  }

  fn on_next(&mut self, value: T) {
    if self.race.claim(self.index) {
      self.race.emitter.next(value);
    }
  }

  fn on_error(&mut self, error: FluxError) {
    let winner = *self.race.winner.lock();
    match winner {
      Winner::Entrant(index) if index == self.index => self.race.emitter.error(error),
      Winner::Undecided if self.race.abandon() => {
        self.race.cancel_all();
        self.race.emitter.error(error);
      },
      _ => debug!(%error, entrant = self.index, "error from a source that lost the race")
    }
  }

  fn on_complete(&mut self) {
    let winner = *self.race.winner.lock();
    match winner {
      Winner::Entrant(index) if index == self.index => self.race.emitter.complete(),
      Winner::Undecided => {
        if self.race.running.fetch_sub(1, Ordering::AcqRel) == 1 && self.race.abandon() {
          self.race.emitter.complete();
        }
      },
      _ => ()
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicBool;
  use std::time::Duration;

  use super::*;
  use crate::scheduler::{SchedulerRef, VirtualTimeScheduler};
  use crate::sources;
  use crate::verifier::StepVerifier;

  const BRANDS: [&str; 4] = ["Audi", "BMW", "Kia", "Toyota"];
  const MODELS: [&str; 4] = ["A3", "X5", "Rio", "Land Cruiser"];

  /// Forwards its upstream, raising a flag when its subscription is cancelled.
  struct Watched<S> {
    upstream : S,
    cancelled: Arc<AtomicBool>
  }

  fn watched<S>(upstream: S) -> (Watched<S>, Arc<AtomicBool>) {
    let cancelled = Arc::new(AtomicBool::new(false));
    (Watched { upstream, cancelled: cancelled.clone() }, cancelled)
  }

  impl<S> Source for Watched<S>
  where
    S: Source
  {
    type Item = S::Item;

    fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
      self.upstream.subscribe(Box::new(WatchedSubscriber {
        downstream: subscriber,
        cancelled : self.cancelled.clone()
      }));
    }
  }

  struct WatchedSubscriber<T> {
    downstream: BoxSubscriber<T>,
    cancelled : Arc<AtomicBool>
  }

  impl<T> Subscriber<T> for WatchedSubscriber<T>
  where
    T: Send + 'static
  {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
      self.downstream.on_subscribe(Arc::new(WatchedSubscription {
        upstream : subscription,
        cancelled: self.cancelled.clone()
      }));
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

  struct WatchedSubscription {
    upstream : SubscriptionRef,
    cancelled: Arc<AtomicBool>
  }

  impl Subscription for WatchedSubscription {
    fn request(&self, n: u64) {
      self.upstream.request(n);
    }

    fn cancel(&self) {
      self.cancelled.store(true, Ordering::SeqCst);
      self.upstream.cancel();
    }
  }

  #[test]
  fn merge_interleaves_by_arrival() {
    StepVerifier::with_virtual_time(|| {
      let brands = sources::from_array(BRANDS).delay_elements(Duration::from_millis(500));
      let models = sources::from_array(MODELS)
        .delay_subscription(Duration::from_millis(250))
        .delay_elements(Duration::from_millis(500));
      brands.merge_with(models)
    })
      .expect_next_seq(["Audi", "A3", "BMW", "X5", "Kia", "Rio", "Toyota", "Land Cruiser"])
      .verify_complete();
  }

  #[test]
  fn merge_of_nothing_completes() {
    StepVerifier::create(merge::<u8>(Vec::new())).verify_complete();
  }

  #[test]
  fn merge_fails_with_the_first_error() {
    let merged = merge(vec![
      sources::never::<u8>().boxed(),
      sources::error(FluxError::Custom("broken".into())).boxed()
    ]);

    StepVerifier::create(merged)
      .expect_error_matches(|error| error.to_string() == "broken")
      .verify();
  }

  #[test]
  fn zip_pairs_by_index() {
    StepVerifier::create(sources::from_array(BRANDS).zip(sources::from_iter(MODELS.to_vec())))
      .expect_next(("Audi", "A3"))
      .expect_next(("BMW", "X5"))
      .expect_next(("Kia", "Rio"))
      .expect_next(("Toyota", "Land Cruiser"))
      .verify_complete();
  }

  #[test]
  fn zip_with_combines_and_stops_at_the_shortest() {
    let cars = zip_with(sources::from_array(BRANDS), sources::from_array(["A3", "X5"]), |brand, model| {
      format!("car {brand} {model}")
    });

    StepVerifier::create(cars)
      .expect_next("car Audi A3".to_string())
      .expect_next("car BMW X5".to_string())
      .verify_complete();
  }

  #[test]
  fn zip_waits_for_the_slower_side() {
    StepVerifier::with_virtual_time(|| {
      sources::range(0, 3)
        .delay_elements(Duration::from_secs(1))
        .zip(sources::from_array(['a', 'b', 'c']))
    })
      .expect_no_event(Duration::from_millis(999))
      .expect_next((0, 'a'))
      .expect_next((1, 'b'))
      .expect_next((2, 'c'))
      .verify_complete();
  }

  #[test]
  fn zip_respects_demand() {
    StepVerifier::create_with_demand(sources::range(0, 3).zip(sources::range(10, 3)), 1)
      .expect_next((0, 10))
      .expect_no_event(Duration::from_millis(20))
      .then_request(2)
      .expect_next_seq([(1, 11), (2, 12)])
      .verify_complete();
  }

  #[test]
  fn first_mirrors_the_first_to_emit() {
    StepVerifier::create(first(vec![sources::from_array(BRANDS).boxed(), sources::from_array(MODELS).boxed()]))
      .expect_next_seq(BRANDS)
      .verify_complete();
  }

  #[test]
  fn first_ignores_slower_sources() {
    StepVerifier::with_virtual_time(|| {
      first(vec![
        sources::from_array(BRANDS).delay_subscription(Duration::from_secs(1)).boxed(),
        sources::from_array(MODELS).delay_elements(Duration::from_millis(100)).boxed()
      ])
    })
      .expect_next_seq(MODELS)
      .verify_complete();
  }

  #[test]
  fn first_cancels_the_losers() {
    let scheduler = VirtualTimeScheduler::new();
    let timer: SchedulerRef = Arc::new(scheduler.clone());
    let models = sources::from_array(MODELS).delay_elements_on(Duration::from_secs(1), timer.clone());
    let (models, cancelled) = watched(models);
    let brands = sources::from_array(BRANDS).delay_elements_on(Duration::from_millis(100), timer);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let copy = seen.clone();
    let _disposable = first(vec![brands.boxed(), models.boxed()]).subscribe_with(move |item| copy.lock().push(item));
    assert!(!cancelled.load(Ordering::SeqCst));

    scheduler.advance_time_by(Duration::from_millis(100));
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(*seen.lock(), vec!["Audi"]);

    scheduler.advance_time_by(Duration::from_secs(10));
    assert_eq!(*seen.lock(), BRANDS.to_vec());
  }

  #[test]
  fn first_cancels_losers_arriving_after_the_winner() {
    let scheduler = VirtualTimeScheduler::new();
    let timer: SchedulerRef = Arc::new(scheduler.clone());
    let late = sources::from_array(MODELS).delay_subscription_on(Duration::from_secs(1), timer);
    let (late, late_cancelled) = watched(late);
    let (synchronous, synchronous_cancelled) = watched(sources::from_array(MODELS));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let copy = seen.clone();
    let _disposable = first(vec![sources::from_array(BRANDS).boxed(), late.boxed(), synchronous.boxed()])
      .subscribe_with(move |item| copy.lock().push(item));
    assert!(late_cancelled.load(Ordering::SeqCst));
    assert!(synchronous_cancelled.load(Ordering::SeqCst));

    scheduler.advance_time_by(Duration::from_secs(2));
    assert_eq!(*seen.lock(), BRANDS.to_vec());
    assert_eq!(scheduler.pending_tasks(), 0);
  }

  #[test]
  fn first_skips_empty_sources_and_fails_before_a_winner() {
    StepVerifier::create(first(vec![sources::empty().boxed(), sources::just(3).boxed()]))
      .expect_next(3)
      .verify_complete();

    StepVerifier::create(first(vec![sources::empty::<u8>().boxed(), sources::empty().boxed()]))
      .verify_complete();

    StepVerifier::create(first(vec![
      sources::error(FluxError::Custom("early".into())).boxed(),
      sources::just(3).boxed()
    ]))
      .expect_error_matches(|error| error.to_string() == "early")
      .verify();
  }
}
