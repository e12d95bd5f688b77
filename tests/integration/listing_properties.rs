//! Listing bodies rebuilt into snapshots, in any record order

use proptest::prelude::*;
use std::io::Cursor;
use syncore::listing::{listing_to_csv, parse_full_listing};
use syncore::snapshot::{NameCaseRule, Snapshot, SnapshotBuilder, SnapshotItem};
use syncore::types::{NodeType, ReplicaSide};

const ROOT: &str = "1";

/// Random tree: item i hangs under the root or an earlier directory
fn tree_strategy() -> impl Strategy<Value = Vec<SnapshotItem>> {
    prop::collection::vec((any::<bool>(), any::<prop::sample::Index>(), "[a-z ,\"\r\n]{1,8}"), 1..40).prop_map(
        |specs| {
            let mut items: Vec<SnapshotItem> = Vec::new();
            let mut dirs: Vec<String> = vec![ROOT.to_string()];
            for (i, (is_dir, parent, name)) in specs.into_iter().enumerate() {
                let id = (i + 10).to_string();
                let parent_id = parent.get(&dirs).clone();
                // suffix the id to keep sibling names unique
                let name = format!("{}-{}", name, id);
                let node_type = if is_dir { NodeType::Directory } else { NodeType::File };
                items.push(
                    SnapshotItem::new(id.clone(), parent_id, name, node_type)
                        .with_size(if is_dir { 0 } else { i as i64 * 7 })
                        .with_times(1_000, 2_000 + i as i64),
                );
                if is_dir {
                    dirs.push(id);
                }
            }
            items
        },
    )
}

proptest! {
    #[test]
    fn shuffled_listing_builds_a_complete_tree(
        items in tree_strategy(),
        seed in any::<u64>(),
    ) {
        let mut shuffled = items.clone();
        // deterministic shuffle without an rng dependency
        let len = shuffled.len();
        for i in (1..len).rev() {
            let j = (seed.wrapping_mul(i as u64 + 31) % (i as u64 + 1)) as usize;
            shuffled.swap(i, j);
        }

        let body = listing_to_csv("cursor-9", &shuffled);
        let listing = parse_full_listing(Cursor::new(body)).unwrap();
        prop_assert_eq!(listing.items.len(), items.len());
        prop_assert_eq!(listing.cursor.as_str(), "cursor-9");

        let mut builder = SnapshotBuilder::new(Snapshot::new(ReplicaSide::Remote, ROOT, NameCaseRule::Sensitive));
        builder.extend(listing.items);
        let (snapshot, report) = builder.finish();
        prop_assert!(report.is_clean());
        prop_assert_eq!(snapshot.len(), items.len());
        snapshot.check_integrity().unwrap();

        for item in &items {
            let stored = snapshot.get(&item.id).unwrap();
            prop_assert_eq!(stored, item);
            let (path, _) = snapshot.path(&item.id).unwrap();
            prop_assert_eq!(snapshot.id_from_path(&path), Some(item.id.clone()));
            prop_assert!(snapshot.is_ancestor_or_self(ROOT, &item.id));
        }
    }
}
