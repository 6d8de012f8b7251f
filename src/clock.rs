use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};


///////////////////////////////////////////////////////////////////////////////////////////////////
// CLOCK
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A monotonic time source, read as the time elapsed since the clock's origin.
///
/// Operators never read the wall clock directly: they ask the clock of the scheduler
/// they run on, so that a virtual clock can stand in for real time in tests.
pub trait Clock: Send + Sync + 'static {
  /// Time elapsed since the origin of this clock.
  fn now(&self) -> Duration;
}

/// A shared clock reference.
pub type ClockRef = Arc<dyn Clock>;


///////////////////////////////////////////////////////////////////////////////////////////////////
// SYSTEM CLOCK
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A clock following real (monotonic) time, starting at its creation.
#[derive(Clone, Debug)]
pub struct SystemClock {
  origin: Instant
}

impl SystemClock {
  /// Creates a new `SystemClock` whose origin is now.
  pub fn new() -> Self {
    SystemClock { origin: Instant::now() }
  }
}

impl Default for SystemClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for SystemClock {
  fn now(&self) -> Duration {
    self.origin.elapsed()
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// VIRTUAL CLOCK
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A clock that only moves when told to.
///
/// Time is stored with nanosecond resolution. The clock never goes backwards:
/// setting it to an earlier time is a no-op.
#[derive(Debug, Default)]
pub struct VirtualClock {
  nanos: AtomicU64
}

impl VirtualClock {
  /// Creates a virtual clock at time zero.
  pub fn new() -> Self {
    VirtualClock { nanos: AtomicU64::new(0) }
  }

  /// Moves the clock to `time`, unless it is already past it.
  pub fn set(&self, time: Duration) {
    self.nanos.fetch_max(to_nanos(time), Ordering::AcqRel);
  }
}

impl Clock for VirtualClock {
  fn now(&self) -> Duration {
    Duration::from_nanos(self.nanos.load(Ordering::Acquire))
  }
}

fn to_nanos(duration: Duration) -> u64 {
  u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn virtual_clock_moves_only_on_command() {
    let clock = VirtualClock::new();
    assert_eq!(clock.now(), Duration::ZERO);

    clock.set(Duration::from_millis(250));
    assert_eq!(clock.now(), Duration::from_millis(250));

    clock.set(Duration::from_secs(2));
    assert_eq!(clock.now(), Duration::from_secs(2));
  }

  #[test]
  fn virtual_clock_never_goes_backwards() {
    let clock = VirtualClock::new();
    clock.set(Duration::from_secs(5));
    clock.set(Duration::from_secs(1));
    assert_eq!(clock.now(), Duration::from_secs(5));
  }

  #[test]
  fn system_clock_is_monotonic() {
    let clock = SystemClock::new();
    let first = clock.now();
    let second = clock.now();
    assert!(second >= first);
  }
}
