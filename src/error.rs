use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;


/// Boxed error returned by fallible user functions (see `Source::try_map`).
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;


///////////////////////////////////////////////////////////////////////////////////////////////////
// FLUX ERROR
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Errors travelling downstream through `Subscriber::on_error`.
///
/// The type is `Clone` because a single failure may have to be reported to several
/// branches of a subscription tree (e.g. every inner source of a `flat_map`).
#[derive(Clone, Debug, Error)]
pub enum FluxError {
  /// The demand contract was broken: more items than requested, a signal after a
  /// terminal signal, or a non-positive request. Never expected in correct usage.
  #[error("protocol violation: {0}")]
  ProtocolViolation(String),

  /// A user-supplied transformation failed.
  #[error("user function failed: {0}")]
  UserFunction(UserError),

  /// A push source produced an item while its subscriber had no outstanding demand.
  #[error("overflow: {source_name} could not emit item {index} for lack of demand")]
  Overflow {
    /// The push source that overflowed.
    source_name: &'static str,
    /// Zero-based index of the dropped item.
    index: u64,
  },

  /// A scheduler refused a task (e.g. a delayed task on the immediate scheduler).
  #[error("task rejected by {scheduler}: {reason}")]
  Rejected {
    /// Name of the rejecting scheduler.
    scheduler: &'static str,
    /// Why the task was rejected.
    reason: String,
  },

  /// A source was built from arguments it cannot honour, e.g. a `range` running past
  /// `i64::MAX`. Reported to every subscriber.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// A one-shot source was subscribed to a second time.
  #[error("source can only be subscribed once and has already been consumed")]
  SourceConsumed,

  /// An error injected on purpose, e.g. through `sources::error`.
  #[error("{0}")]
  Custom(String),
}

impl FluxError {
  /// Wraps an error raised by a user function.
  pub fn user<E>(error: E) -> Self
  where
    E: Into<BoxError>
  {
    FluxError::UserFunction(UserError(Arc::from(error.into())))
  }

  /// Builds a protocol violation with the given description.
  pub fn protocol<S: Into<String>>(description: S) -> Self {
    FluxError::ProtocolViolation(description.into())
  }

  /// Short name of the error kind, used in verification reports.
  pub fn kind(&self) -> &'static str {
    match self {
      FluxError::ProtocolViolation(_) => "ProtocolViolation",
      FluxError::UserFunction(_)      => "UserFunctionError",
      FluxError::Overflow { .. }      => "Overflow",
      FluxError::Rejected { .. }      => "Rejected",
      FluxError::InvalidArgument(_)   => "InvalidArgument",
      FluxError::SourceConsumed       => "SourceConsumed",
      FluxError::Custom(_)            => "Custom",
    }
  }
}


/// Errors compare by kind and message, user errors included.
impl PartialEq for FluxError {
  fn eq(&self, other: &Self) -> bool {
    self.kind() == other.kind() && self.to_string() == other.to_string()
  }
}


/// A shareable user error, kept behind an `Arc` so that `FluxError` stays `Clone`.
#[derive(Clone, Debug)]
pub struct UserError(Arc<dyn Error + Send + Sync + 'static>);

impl fmt::Display for UserError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// VERIFICATION ERROR
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Failures reported by the `StepVerifier`.
///
/// Every variant names what the verifier expected and what it actually observed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum VerificationError {
  /// A signal of the wrong kind arrived (e.g. `onComplete` while a value was expected).
  #[error("expectation {step} failed: expected {expected}, got {actual}")]
  UnexpectedSignal {
    /// Index of the failing expectation.
    step: usize,
    /// Description of the expected signal.
    expected: String,
    /// Description of the received signal.
    actual: String,
  },

  /// A value arrived but did not satisfy the expectation.
  #[error("expectation {step} failed: expected {expected}, got value {actual}")]
  ValueMismatch {
    /// Index of the failing expectation.
    step: usize,
    /// Description of the expected value.
    expected: String,
    /// Debug rendering of the received value.
    actual: String,
  },

  /// No signal arrived in time.
  #[error("expectation {step} failed: expected {expected}, but nothing arrived within {waited:?}")]
  Timeout {
    /// Index of the failing expectation.
    step: usize,
    /// Description of the expected signal.
    expected: String,
    /// How long the verifier waited.
    waited: Duration,
  },

  /// A signal arrived while `expect_no_event` required silence.
  #[error("expectation {step} failed: expected no event for {window:?}, got {actual}")]
  UnexpectedEvent {
    /// Index of the failing expectation.
    step: usize,
    /// Length of the silent window.
    window: Duration,
    /// Description of the received signal.
    actual: String,
  },

  /// The source under test broke the demand protocol.
  #[error("protocol violation observed by the verifier: {0}")]
  Protocol(String),
}
