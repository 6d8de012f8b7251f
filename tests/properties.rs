use std::collections::HashSet;

use proptest::prelude::*;

use fluxrust::sources;
use fluxrust::{Single, Source};


proptest! {
  #[test]
  fn collect_list_keeps_order(items in prop::collection::vec(any::<i32>(), 0..64)) {
    let collected = sources::from_iter(items.clone()).collect_list().block();
    prop_assert_eq!(collected, Ok(Some(items)));
  }

  #[test]
  fn range_counts_up_from_its_start(start in -1_000i64..1_000, count in 0u64..200) {
    let collected = sources::range(start, count).collect_list().block().unwrap().unwrap();
    prop_assert_eq!(collected.len() as u64, count);
    for (offset, value) in collected.iter().enumerate() {
      prop_assert_eq!(*value, start + offset as i64);
    }
  }

  #[test]
  fn distinct_is_idempotent(items in prop::collection::vec(0u8..16, 0..64)) {
    let once = sources::from_iter(items.clone()).distinct().collect_list().block().unwrap().unwrap();
    let twice = sources::from_iter(items.clone()).distinct().distinct().collect_list().block().unwrap().unwrap();
    prop_assert_eq!(&once, &twice);

    let unique: HashSet<_> = once.iter().copied().collect();
    prop_assert_eq!(unique.len(), once.len());
    let all: HashSet<_> = items.iter().copied().collect();
    prop_assert_eq!(unique, all);
  }

  #[test]
  fn buffer_batches_cover_the_input(items in prop::collection::vec(any::<u16>(), 0..100), size in 1usize..10) {
    let batches = sources::from_iter(items.clone()).buffer(size).collect_list().block().unwrap().unwrap();

    prop_assert_eq!(batches.len(), items.len().div_ceil(size));
    if let Some((last, full)) = batches.split_last() {
      prop_assert!(full.iter().all(|batch| batch.len() == size));
      prop_assert!(!last.is_empty() && last.len() <= size);
    }
    prop_assert_eq!(batches.concat(), items);
  }

  #[test]
  fn take_and_skip_split_the_input(items in prop::collection::vec(any::<u8>(), 0..50), count in 0u64..60) {
    let taken = sources::from_iter(items.clone()).take(count).collect_list().block().unwrap().unwrap();
    let skipped = sources::from_iter(items.clone()).skip(count).collect_list().block().unwrap().unwrap();
    prop_assert_eq!([taken, skipped].concat(), items);
  }
}
