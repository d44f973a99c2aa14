//! Property test: staging store bounds track a simple model.
//!
//! Random sequences of add / consume-oldest / reopen are applied to both a
//! `StagingFileStore` and a `BTreeSet` of live ids. After every step the
//! store's min/max match the model, and ids handed out are contiguous.

use std::collections::BTreeSet;
use std::path::Path;

use planb::descriptor::FileDescriptor;
use planb::staging::EMPTY;
use planb::StagingFileStore;
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Add,
    ConsumeOldest,
    Reopen,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Add),
        3 => Just(Op::ConsumeOldest),
        1 => Just(Op::Reopen),
    ]
}

fn add_part(store: &StagingFileStore, src: &Path, n: usize) -> i64 {
    let path = src.join(format!("part-{}", n));
    std::fs::write(&path, n.to_le_bytes()).unwrap();
    let d = FileDescriptor::for_path(n as i64, 0, &path).unwrap();
    store.add(&d, &path).unwrap().id()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_bounds_follow_model(ops in prop::collection::vec(op(), 1..40)) {
        let dir = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let root = dir.path().join("staging");
        let mut store = StagingFileStore::open(&root).unwrap();
        let mut live: BTreeSet<i64> = BTreeSet::new();
        let mut next: i64 = 0;

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Add => {
                    let id = add_part(&store, src.path(), n);
                    prop_assert_eq!(id, next);
                    live.insert(id);
                    next += 1;
                }
                Op::ConsumeOldest => {
                    if let Some(&oldest) = live.iter().next() {
                        let file = store.await_next(oldest).unwrap();
                        prop_assert_eq!(file.id(), oldest);
                        store.delete(&file).unwrap();
                        live.remove(&oldest);
                    }
                }
                Op::Reopen => {
                    drop(store);
                    store = StagingFileStore::open(&root).unwrap();
                    // A reopened store continues after the highest live id.
                    next = live.iter().next_back().map_or(0, |max| max + 1);
                }
            }

            prop_assert_eq!(store.min_store_id(), live.iter().next().copied().unwrap_or(EMPTY));
            prop_assert_eq!(store.max_store_id(), live.iter().next_back().copied().unwrap_or(EMPTY));
            prop_assert_eq!(store.is_empty(), live.is_empty());
        }
    }
}
