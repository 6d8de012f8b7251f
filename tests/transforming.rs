use std::time::Duration;

use fluxrust::sources;
use fluxrust::scheduler;
use fluxrust::{Source, StepVerifier};

const FRUITS: [&str; 5] = ["apple", "orange", "banana", "kiwi", "strawberry"];


#[derive(Clone, Debug, PartialEq)]
struct Player {
  first_name: String,
  last_name : String
}

impl Player {
  fn parse(name: &str) -> Self {
    let (first, last) = name.split_once(' ').unwrap_or((name, ""));
    Player { first_name: first.into(), last_name: last.into() }
  }
}


#[test]
fn skip_several_seconds() {
  StepVerifier::with_virtual_time(|| {
    sources::from_array([1, 2, 3, 4])
      .delay_elements(Duration::from_secs(1))
      .skip_for(Duration::from_secs(2))
  })
    .expect_next_seq([2, 3, 4])
    .verify_complete();
}

#[test]
fn take_several_seconds() {
  StepVerifier::with_virtual_time(|| {
    sources::from_array([1, 2, 3, 4])
      .delay_elements(Duration::from_secs(1))
      .take_for(Duration::from_secs(3))
  })
    .expect_next_seq([1, 2])
    .verify_complete();
}

#[test]
fn filter_objects() {
  StepVerifier::create(sources::range(1, 5).filter(|number| *number > 3))
    .expect_next_seq([4, 5])
    .verify_complete();
}

#[test]
fn distinct_objects() {
  StepVerifier::create(sources::from_array([1, 1, 2, 3]).distinct())
    .expect_next_seq([1, 2, 3])
    .verify_complete();
}

#[test]
fn map_objects() {
  StepVerifier::create(sources::from_array([1, 2, 3]).map(|number| format!("Number{number}")))
    .expect_next_seq(["Number1", "Number2", "Number3"].map(String::from))
    .verify_complete();
}

#[test]
fn flat_map_on_the_parallel_scheduler() {
  let names = ["Michael Jordan", "Scottie Pippen", "Steve Kerr"];
  let players = sources::from_array(names)
    .flat_map(sources::just)
    .map(Player::parse)
    .subscribe_on(scheduler::parallel());

  let expected: Vec<Player> = names.iter().map(|name| Player::parse(name)).collect();
  let known = move |player: &Player| expected.contains(player);
  StepVerifier::create(players)
    .expect_next_matches(known.clone())
    .expect_next_matches(known.clone())
    .expect_next_matches(known)
    .verify_complete();
}

#[test]
fn buffer() {
  StepVerifier::create(sources::from_array(FRUITS).buffer(3))
    .expect_next(vec!["apple", "orange", "banana"])
    .expect_next(vec!["kiwi", "strawberry"])
    .verify_complete();
}

#[test]
fn parallel_batches() {
  let upper = sources::from_array(FRUITS)
    .buffer(3)
    .flat_map(|batch| {
      sources::from_iter(batch)
        .map(str::to_uppercase)
        .subscribe_on(scheduler::parallel())
        .log("batch")
    });

  StepVerifier::create(upper)
    .expect_next_count(5)
    .verify_complete();
}

#[test]
fn collect_list() {
  StepVerifier::create(sources::from_array(FRUITS).collect_list())
    .expect_next(FRUITS.to_vec())
    .verify_complete();
}

#[test]
fn retry_after_a_failing_map() {
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  let attempts = Arc::new(AtomicU32::new(0));
  let counter = attempts.clone();
  let flaky = sources::just(())
    .try_map(move |_| {
      if counter.fetch_add(1, Ordering::SeqCst) < 2 { Err("not yet") } else { Ok("done") }
    })
    .retry(2);

  StepVerifier::create(flaky)
    .expect_next("done")
    .verify_complete();
  assert_eq!(attempts.load(Ordering::SeqCst), 3);
}
