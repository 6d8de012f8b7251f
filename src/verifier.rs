use std::fmt::Debug;
use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{FluxError, VerificationError};
use crate::scheduler::{self, VirtualTimeScheduler};
use crate::source::{BoxSource, Source};
use crate::subscribers::{StrictSubscriber, ViolationLog};
use crate::subscription::{Signal, Subscriber, SubscriptionRef, UNBOUNDED};


/// How long `verify` waits for the whole expectation script by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a virtual-time verifier looks for new tasks while waiting on real workers.
const POLL_SLICE: Duration = Duration::from_millis(5);


///////////////////////////////////////////////////////////////////////////////////////////////////
// STEPS
///////////////////////////////////////////////////////////////////////////////////////////////////

type ValueCheck<T> = Box<dyn Fn(&T) -> bool>;
type ErrorCheck = Box<dyn Fn(&FluxError) -> bool>;

enum Step<T> {
  Next { expected: String, check: ValueCheck<T> },
  NextCount(u64),
  NoEvent(Duration),
  Await(Duration),
  Request(u64),
  Cancel,
  Complete,
  Error { expected: String, check: ErrorCheck }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// STEP VERIFIER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A scripted subscriber checking the signals of a source one expectation at a time.
///
/// Expectations are queued with the `expect_*` and `then_*` methods, then run by one of the
/// `verify*` methods, which subscribe to the source. A verifier built with `with_virtual_time`
/// moves its virtual clock forward whenever it waits for a signal, so time-based pipelines
/// are checked instantly and deterministically.
///
/// A verifier dropped without being verified panics, so that a forgotten `verify` fails the
/// test instead of silently passing.
pub struct StepVerifier<T>
where
  T: Debug + Send + 'static
{
  source        : BoxSource<T>,
  initial_demand: u64,
  virtual_time  : Option<VirtualTimeScheduler>,
  steps         : Vec<Step<T>>,
  driven        : bool
}

impl<T> StepVerifier<T>
where
  T: Debug + Send + 'static
{
  /// Verifies `source`, requesting unbounded demand on subscription.
  pub fn create<S>(source: S) -> Self
  where
    S: Source<Item = T>
  {
    Self::create_with_demand(source, UNBOUNDED)
  }

  /// Verifies `source`, requesting `initial_demand` items on subscription (none for zero).
  pub fn create_with_demand<S>(source: S, initial_demand: u64) -> Self
  where
    S: Source<Item = T>
  {
    StepVerifier {
      source: source.boxed(),
      initial_demand,
      virtual_time: None,
      steps: Vec::new(),
      driven: false
    }
  }

  /// Verifies the source built by `supplier`, in virtual time.
  ///
  /// `supplier` runs with a fresh `VirtualTimeScheduler` as the default timer, so every
  /// time-based operator it builds without an explicit scheduler is driven by the verifier.
  pub fn with_virtual_time<S, F>(supplier: F) -> Self
  where
    S: Source<Item = T>,
    F: FnOnce() -> S
  {
    let virtual_time = VirtualTimeScheduler::new();
    let source = scheduler::with_default_timer(Arc::new(virtual_time.clone()), supplier);
    let mut verifier = Self::create(source);
    verifier.virtual_time = Some(virtual_time);
    verifier
  }

  fn push(mut self, step: Step<T>) -> Self {
    self.steps.push(step);
    self
  }

  // Expectations

  /// Expects the next signal to be an item equal to `value`.
  pub fn expect_next(self, value: T) -> Self
  where
    T: PartialEq + 'static
  {
    let expected = format!("on_next({value:?})");
    self.push(Step::Next { expected, check: Box::new(move |item| *item == value) })
  }

  /// Expects the next signals to be items equal to `values`, in order.
  pub fn expect_next_seq<I>(self, values: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: PartialEq + 'static
  {
    values.into_iter().fold(self, Self::expect_next)
  }

  /// Expects the next signal to be an item satisfying `predicate`.
  pub fn expect_next_matches<P>(self, predicate: P) -> Self
  where
    P: Fn(&T) -> bool + 'static
  {
    self.push(Step::Next { expected: "an item matching the predicate".into(), check: Box::new(predicate) })
  }

  /// Expects `count` items, whatever their values.
  pub fn expect_next_count(self, count: u64) -> Self {
    self.push(Step::NextCount(count))
  }

  /// Expects no signal at all for `window`.
  pub fn expect_no_event(self, window: Duration) -> Self {
    self.push(Step::NoEvent(window))
  }

  /// Expects the source to complete.
  pub fn expect_complete(self) -> Self {
    self.push(Step::Complete)
  }

  /// Expects the source to fail, with any error.
  pub fn expect_error(self) -> Self {
    self.push(Step::Error { expected: "on_error".into(), check: Box::new(|_| true) })
  }

  /// Expects the source to fail with an error satisfying `predicate`.
  pub fn expect_error_matches<P>(self, predicate: P) -> Self
  where
    P: Fn(&FluxError) -> bool + 'static
  {
    self.push(Step::Error { expected: "an error matching the predicate".into(), check: Box::new(predicate) })
  }

  // Actions

  /// Lets `duration` pass, virtual or real, without expecting anything.
  pub fn then_await(self, duration: Duration) -> Self {
    self.push(Step::Await(duration))
  }

  /// Requests `n` more items.
  pub fn then_request(self, n: u64) -> Self {
    self.push(Step::Request(n))
  }

  /// Cancels the subscription.
  pub fn then_cancel(self) -> Self {
    self.push(Step::Cancel)
  }

  // Drivers

  /// Runs the script, panicking with a report on the first unmet expectation.
  /// Returns how long the verification took, in real time.
  pub fn verify(self) -> Duration {
    self.verify_timeout(DEFAULT_TIMEOUT)
  }

  /// `verify`, giving up once `timeout` has elapsed.
  pub fn verify_timeout(mut self, timeout: Duration) -> Duration {
    match self.run(timeout) {
      Ok(elapsed) => elapsed,
      Err(error) => panic!("verification failed: {error}")
    }
  }

  /// Runs the script, returning the first unmet expectation as an error.
  pub fn try_verify(self) -> Result<Duration, VerificationError> {
    self.try_verify_timeout(DEFAULT_TIMEOUT)
  }

  /// `try_verify`, giving up once `timeout` has elapsed.
  pub fn try_verify_timeout(mut self, timeout: Duration) -> Result<Duration, VerificationError> {
    self.run(timeout)
  }

  /// Expects completion, then runs the script.
  pub fn verify_complete(self) -> Duration {
    self.expect_complete().verify()
  }

  /// Expects an error, then runs the script.
  pub fn verify_error(self) -> Duration {
    self.expect_error().verify()
  }

  fn run(&mut self, timeout: Duration) -> Result<Duration, VerificationError> {
    self.driven = true;
    let started = Instant::now();

    let (sender, receiver) = unbounded();
    let subscription = Arc::new(Mutex::new(None));
    let (probe, violations) = StrictSubscriber::new(Probe {
      sender,
      subscription  : subscription.clone(),
      initial_demand: self.initial_demand
    });
    self.source.subscribe(Box::new(probe));

    let session = Session {
      receiver,
      subscription,
      violations,
      virtual_time: self.virtual_time.clone(),
      deadline    : started + timeout,
      timeout
    };
    let outcome = session.play(mem::take(&mut self.steps));
    session.cancel();

    outcome?;
    session.check_protocol()?;
    debug!(elapsed = ?started.elapsed(), "verification passed");
    Ok(started.elapsed())
  }
}

impl<T> Drop for StepVerifier<T>
where
  T: Debug + Send + 'static
{
  fn drop(&mut self) {
    if !self.driven && !thread::panicking() {
      panic!("StepVerifier dropped without being verified: call `verify` or one of its variants");
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SESSION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// One run of a script against a live subscription.
struct Session<T> {
  receiver    : Receiver<Signal<T>>,
  subscription: Arc<Mutex<Option<SubscriptionRef>>>,
  violations  : ViolationLog,
  virtual_time: Option<VirtualTimeScheduler>,
  deadline    : Instant,
  timeout     : Duration
}

impl<T> Session<T>
where
  T: Debug
{
  fn play(&self, steps: Vec<Step<T>>) -> Result<(), VerificationError> {
    for (index, step) in steps.into_iter().enumerate() {
      match step {
        Step::Next { expected, check } => match self.next_signal(index, &expected)? {
          Signal::Next(value) if check(&value) => (),
          Signal::Next(value) => {
            return Err(VerificationError::ValueMismatch { step: index, expected, actual: format!("{value:?}") });
          },
          other => return Err(unexpected(index, expected, &other))
        },
        Step::NextCount(count) => {
          for _ in 0..count {
            let expected = format!("{count} items");
            match self.next_signal(index, &expected)? {
              Signal::Next(_) => (),
              other => return Err(unexpected(index, expected, &other))
            }
          }
        },
        Step::NoEvent(window) => self.expect_silence(index, window)?,
        Step::Await(duration) => match &self.virtual_time {
          Some(virtual_time) => virtual_time.advance_time_by(duration),
          None => thread::sleep(duration)
        },
        Step::Request(n) => match self.subscription.lock().clone() {
          Some(subscription) => subscription.request(n),
          None => return Err(VerificationError::Protocol("request before any subscription was received".into()))
        },
        Step::Cancel => self.cancel(),
        Step::Complete => match self.next_signal(index, "on_complete")? {
          Signal::Complete => (),
          other => return Err(unexpected(index, "on_complete".into(), &other))
        },
        Step::Error { expected, check } => match self.next_signal(index, &expected)? {
          Signal::Error(error) if check(&error) => (),
          Signal::Error(error) => {
            return Err(VerificationError::ValueMismatch { step: index, expected, actual: error.to_string() });
          },
          other => return Err(unexpected(index, expected, &other))
        }
      }
    }
    Ok(())
  }

  /// Waits for the next signal, moving virtual time forward when nothing is ready.
  fn next_signal(&self, step: usize, expected: &str) -> Result<Signal<T>, VerificationError> {
    let signal = match &self.virtual_time {
      Some(virtual_time) => self.next_virtual(virtual_time, step, expected)?,
      None => match self.receiver.recv_deadline(self.deadline) {
        Ok(signal) => signal,
        Err(RecvTimeoutError::Timeout) => return Err(self.timed_out(step, expected)),
        Err(RecvTimeoutError::Disconnected) => return Err(self.wait_out(step, expected))
      }
    };

    if matches!(signal, Signal::Error(FluxError::ProtocolViolation(_))) {
      self.check_protocol()?;
    }
    Ok(signal)
  }

  fn next_virtual(
    &self,
    virtual_time: &VirtualTimeScheduler,
    step        : usize,
    expected    : &str
  ) -> Result<Signal<T>, VerificationError> {
    loop {
      match self.receiver.try_recv() {
        Ok(signal) => return Ok(signal),
        Err(TryRecvError::Disconnected) => return Err(self.wait_out(step, expected)),
        Err(TryRecvError::Empty) => ()
      }

      // Real time bounds endless virtual schedules
      if Instant::now() >= self.deadline {
        return Err(self.timed_out(step, expected));
      }
      if virtual_time.advance_to_next() {
        continue;
      }

      // Nothing is due in virtual time: some work may still run on real workers
      match self.receiver.recv_timeout(POLL_SLICE) {
        Ok(signal) => return Ok(signal),
        Err(RecvTimeoutError::Timeout) => (),
        Err(RecvTimeoutError::Disconnected) => return Err(self.wait_out(step, expected))
      }
    }
  }

  fn expect_silence(&self, step: usize, window: Duration) -> Result<(), VerificationError> {
    let received = match &self.virtual_time {
      Some(virtual_time) => {
        virtual_time.advance_time_by(window);
        self.receiver.try_recv().ok()
      },
      None => self.receiver.recv_timeout(window).ok()
    };

    match received {
      Some(signal) => Err(VerificationError::UnexpectedEvent { step, window, actual: describe(&signal) }),
      None => Ok(())
    }
  }

  fn timed_out(&self, step: usize, expected: &str) -> VerificationError {
    VerificationError::Timeout { step, expected: expected.into(), waited: self.timeout }
  }

  /// The source dropped its subscriber without a terminal signal: nothing can arrive
  /// anymore, which is reported as a timeout once the deadline passes.
  fn wait_out(&self, step: usize, expected: &str) -> VerificationError {
    debug!(step, "source released the verifier's subscriber without a terminal signal");
    thread::sleep(self.deadline.saturating_duration_since(Instant::now()));
    self.timed_out(step, expected)
  }

  fn check_protocol(&self) -> Result<(), VerificationError> {
    if self.violations.is_empty() {
      Ok(())
    }
    else {
      Err(VerificationError::Protocol(self.violations.entries().join("; ")))
    }
  }

  fn cancel(&self) {
    let subscription = self.subscription.lock().clone();
    if let Some(subscription) = subscription {
      subscription.cancel();
    }
  }
}

fn describe<T: Debug>(signal: &Signal<T>) -> String {
  match signal {
    Signal::Next(value) => format!("on_next({value:?})"),
    Signal::Error(error) => format!("on_error({error})"),
    Signal::Complete => "on_complete".into()
  }
}

fn unexpected<T: Debug>(step: usize, expected: String, actual: &Signal<T>) -> VerificationError {
  VerificationError::UnexpectedSignal { step, expected, actual: describe(actual) }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// PROBE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The subscriber a verifier subscribes with: it hands every signal over to the verifying
/// thread through a channel.
struct Probe<T> {
  sender        : Sender<Signal<T>>,
  subscription  : Arc<Mutex<Option<SubscriptionRef>>>,
  initial_demand: u64
}

impl<T> Subscriber<T> for Probe<T>
where
  T: Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    *self.subscription.lock() = Some(subscription.clone());
    if self.initial_demand > 0 {
      subscription.request(self.initial_demand);
    }
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
  use super::*;
  use crate::subscription::{BoxSubscriber, EmptySubscription};
  use crate::sources;

  /// Emits items without waiting for any demand.
  struct Rogue;

  impl Source for Rogue {
    type Item = u8;

    fn subscribe(&self, subscriber: BoxSubscriber<u8>) {
      let mut subscriber = subscriber;
      subscriber.on_subscribe(EmptySubscription::shared());
      subscriber.on_next(1);
      subscriber.on_next(2);
      subscriber.on_complete();
    }
  }

  #[test]
  fn reports_the_first_mismatch() {
    let error = StepVerifier::create(sources::from_array([1, 2, 3]))
      .expect_next(1)
      .expect_next(3)
      .try_verify()
      .unwrap_err();

    assert_eq!(error, VerificationError::ValueMismatch {
      step    : 1,
      expected: "on_next(3)".into(),
      actual  : "2".into()
    });
  }

  #[test]
  fn reports_signals_of_the_wrong_kind() {
    let error = StepVerifier::create(sources::just(1))
      .expect_next(1)
      .expect_next(2)
      .try_verify()
      .unwrap_err();

    assert!(matches!(error, VerificationError::UnexpectedSignal { step: 1, ref actual, .. } if actual == "on_complete"));
  }

  #[test]
  fn reports_demand_violations() {
    let error = StepVerifier::create_with_demand(Rogue, 1)
      .expect_next(1)
      .expect_next(2)
      .try_verify()
      .unwrap_err();

    assert!(matches!(error, VerificationError::Protocol(_)));
  }

  #[test]
  fn times_out_on_silent_sources() {
    let error = StepVerifier::create(sources::never::<u8>())
      .expect_complete()
      .try_verify_timeout(Duration::from_millis(30));

    assert!(matches!(error, Err(VerificationError::Timeout { step: 0, .. })));
  }

  /// Lets go of its subscriber without any terminal signal.
  struct Vanishing;

  impl Source for Vanishing {
    type Item = u8;

    fn subscribe(&self, subscriber: BoxSubscriber<u8>) {
      let mut subscriber = subscriber;
      subscriber.on_subscribe(EmptySubscription::shared());
    }
  }

  #[test]
  fn released_subscribers_time_out() {
    let error = StepVerifier::create(Vanishing)
      .expect_next(1)
      .try_verify_timeout(Duration::from_millis(30));

    assert!(matches!(error, Err(VerificationError::Timeout { step: 0, .. })));
  }

  #[test]
  fn endless_virtual_schedules_time_out() {
    let error = StepVerifier::with_virtual_time(|| sources::interval(Duration::from_secs(1)).filter(|_| false))
      .expect_complete()
      .try_verify_timeout(Duration::from_millis(100));

    assert!(matches!(error, Err(VerificationError::Timeout { step: 0, .. })));
  }

  #[test]
  fn virtual_time_needs_no_real_waiting() {
    let elapsed = StepVerifier::with_virtual_time(|| sources::interval(Duration::from_secs(3600)).take(3))
      .expect_next_seq([0, 1, 2])
      .verify_complete();

    assert!(elapsed < Duration::from_secs(5));
  }

  #[test]
  fn counts_and_awaits() {
    StepVerifier::with_virtual_time(|| sources::interval(Duration::from_secs(1)))
      .expect_next_count(2)
      .then_await(Duration::from_millis(500))
      .expect_no_event(Duration::from_millis(400))
      .expect_next(2)
      .then_cancel()
      .verify();
  }

  #[test]
  fn reports_events_in_a_silent_window() {
    let error = StepVerifier::with_virtual_time(|| sources::interval(Duration::from_secs(1)))
      .expect_no_event(Duration::from_secs(1))
      .then_cancel()
      .try_verify()
      .unwrap_err();

    assert_eq!(error, VerificationError::UnexpectedEvent {
      step  : 0,
      window: Duration::from_secs(1),
      actual: "on_next(0)".into()
    });
  }

  #[test]
  #[should_panic(expected = "without being verified")]
  fn undriven_verifiers_panic() {
    let _ = StepVerifier::create(sources::just(1)).expect_next(1);
  }
}
