use std::fmt::Debug;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::FluxError;
use crate::source::{Single, Source};
use crate::subscription::{BoxSubscriber, Subscriber, Subscription, SubscriptionRef, UNBOUNDED};


///////////////////////////////////////////////////////////////////////////////////////////////////
// LOG
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A source forwarding every signal of its upstream unchanged, and recording each of them
/// (requests and cancellation included) as a `tracing` event with a `category` field.
pub struct Log<S> {
  upstream: S,
  category: &'static str
}

impl<S> Log<S> {
  pub(crate) fn new(upstream: S, category: &'static str) -> Self {
    Log { upstream, category }
  }
}

impl<S> Source for Log<S>
where
  S: Source,
  S::Item: Debug
{
  type Item = S::Item;

  fn subscribe(&self, subscriber: BoxSubscriber<S::Item>) {
    self.upstream.subscribe(Box::new(LogSubscriber {
      downstream: subscriber,
      category  : self.category
    }));
  }
}

impl<S> Single for Log<S>
where
  S: Single,
  S::Item: Debug
{}


struct LogSubscriber<T> {
  downstream: BoxSubscriber<T>,
  category  : &'static str
}

impl<T> Subscriber<T> for LogSubscriber<T>
where
  T: Debug + Send + 'static
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    info!(category = self.category, "on_subscribe");
    self.downstream.on_subscribe(Arc::new(LogSubscription {
      upstream: subscription,
      category: self.category
    }));
  }

  fn on_next(&mut self, value: T) {
    info!(category = self.category, ?value, "on_next");
    self.downstream.on_next(value);
  }

  fn on_error(&mut self, error: FluxError) {
    warn!(category = self.category, %error, "on_error");
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    info!(category = self.category, "on_complete");
    self.downstream.on_complete();
  }
}


struct LogSubscription {
  upstream: SubscriptionRef,
  category: &'static str
}

impl Subscription for LogSubscription {
  fn request(&self, n: u64) {
    if n == UNBOUNDED {
      info!(category = self.category, "request(unbounded)");
    }
    else {
      info!(category = self.category, n, "request");
    }
    self.upstream.request(n);
  }

  fn cancel(&self) {
    info!(category = self.category, "cancel");
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

  #[test]
  fn log_is_transparent() {
    StepVerifier::create_with_demand(sources::from_array(["Apple", "Orange"]).log("fruits"), 1)
      .expect_next("Apple")
      .then_request(1)
      .expect_next("Orange")
      .verify_complete();
  }

  #[test]
  fn log_forwards_errors_and_cancellation() {
    StepVerifier::create(sources::error::<u8>(FluxError::Custom("logged".into())).log("failing"))
      .expect_error_matches(|error| error.to_string() == "logged")
      .verify();

    StepVerifier::create(sources::never::<u8>().log("silent"))
      .then_cancel()
      .verify();
  }

  #[test]
  fn logged_singles_stay_singles() {
    assert_eq!(sources::just(7).log("single").block(), Ok(Some(7)));
  }
}
