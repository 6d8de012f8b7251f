//! `fluxrust` is a demand-driven reactive streams library.
//!
//! A *source* is a lazy, cold description of a sequence of items: nothing happens until a
//! *subscriber* subscribes to it, and every subscription replays the whole description on its
//! own. Items only flow as far as the subscriber asked for them, through the `request` method
//! of its *subscription*.
//!
//! Sources are built from values, iterators or timers (see module `sources`), chained into
//! pipelines of operators (the provided methods of `Source`), combined (see module
//! `combinators`), and moved across threads by *schedulers*. Pipelines are checked with a
//! `StepVerifier`, which can drive time-based operators in virtual time.
//!
//! The crate logs through `tracing` but never installs a subscriber; applications do.
//!


/// **Errors travelling through pipelines, and errors reported by verifiers.**
pub mod error;

/// **Clocks tell the time schedulers and time-based operators work with.**
///
/// A `SystemClock` follows the monotonic clock of the host, while a `VirtualClock` only moves
/// when told to, which makes time-based pipelines deterministic in tests.
pub mod clock;

/// **Schedulers are execution contexts, handing out workers which run tasks.**
///
/// Tasks scheduled on one worker run one at a time, in due-time order. Three kinds of
/// schedulers exist:
///
/// * *immediate*, running tasks synchronously on the caller;
/// * *event loops*, running tasks on one (`single`) or several (`parallel`) dedicated threads;
/// * *virtual time*, running tasks only when its clock is advanced.
///
/// Time-based operators built without an explicit scheduler use the `default_timer`, which
/// is the parallel scheduler unless a verifier installed its own virtual-time scheduler.
pub mod scheduler;

/// **The demand protocol between a source and a subscriber.**
///
/// A subscriber receives a `Subscription` in `on_subscribe`, then `on_next` at most as many
/// times as it requested, then at most one terminal signal (`on_error` or `on_complete`).
/// Requesting `UNBOUNDED` lifts the limit; requesting zero items is a protocol violation.
pub mod subscription;

mod emitter;

/// Ready-made subscribers: closures, protocol checking, and disposable handles.
pub mod subscribers;

/// **Sources, and the operators chaining them into pipelines.**
///
/// Every operator is a provided method of `Source`, returning a new source wrapping its
/// upstream (see module `operators`). `Single` marks sources producing at most one item,
/// which can be awaited with `block`.
pub mod source;

/// Constructors of sources: from values, iterators, ranges and timers.
pub mod sources;

pub mod operators;

/// **Combinators build one source out of several.**
///
/// * `merge` interleaves the items of its sources as they arrive;
/// * `zip` pairs the n-th items of two sources;
/// * `first` mirrors whichever source emits first.
pub mod combinators;

/// **A step-by-step verifier for sources.**
///
/// Expectations on the signals of a source are queued, then checked in order against a live
/// subscription. In virtual time, the verifier advances the clock whenever it has to wait.
pub mod verifier;


pub use crate::error::{FluxError, VerificationError};
pub use crate::scheduler::{Scheduler, SchedulerRef, VirtualTimeScheduler};
pub use crate::source::{BoxSource, Single, Source};
pub use crate::subscription::{Signal, Subscriber, Subscription, SubscriptionRef, UNBOUNDED};
pub use crate::verifier::StepVerifier;
