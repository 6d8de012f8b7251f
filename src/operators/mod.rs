//! Stages built by the chaining methods of `Source`.
//!
//! Every stage owns its upstream and is itself a `Source`; subscribing to a stage
//! subscribes to its upstream with a subscriber applying the stage's transformation.

/// `map`, `try_map`, `filter` and `distinct`.
pub mod transform;

/// `skip` and `take`, by count and by duration.
pub mod limit;

/// `buffer` and `collect_list`.
pub mod buffer;

/// `delay_elements` and `delay_subscription`.
pub mod time;

/// `subscribe_on`.
pub mod schedule;

/// `flat_map`, and the merge point it shares with `combinators::merge`.
pub mod flat_map;

/// `retry`.
pub mod retry;

/// `log`.
pub mod log;
