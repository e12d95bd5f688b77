//! Path resolution on a large snapshot

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::path::PathBuf;
use syncore::snapshot::{NameCaseRule, Snapshot, SnapshotItem};
use syncore::types::{NodeType, ReplicaSide};

/// `width` directories per level, `depth` levels, one file per leaf directory
fn build(width: usize, depth: usize) -> (Snapshot, Vec<String>) {
    let mut snapshot = Snapshot::new(ReplicaSide::Local, "root", NameCaseRule::Sensitive);
    let mut level = vec!["root".to_string()];
    let mut next_id = 0usize;
    let mut files = Vec::new();
    for _ in 0..depth {
        let mut next_level = Vec::new();
        for parent in &level {
            for i in 0..width {
                next_id += 1;
                let id = format!("d{}", next_id);
                snapshot
                    .upsert(SnapshotItem::new(id.clone(), parent.clone(), format!("dir{}", i), NodeType::Directory))
                    .expect("unique directory");
                next_level.push(id);
            }
        }
        level = next_level;
    }
    for parent in &level {
        next_id += 1;
        let id = format!("f{}", next_id);
        snapshot
            .upsert(SnapshotItem::new(id.clone(), parent.clone(), "data.bin", NodeType::File).with_size(1024))
            .expect("unique file");
        files.push(id);
    }
    snapshot.set_valid(true);
    (snapshot, files)
}

fn bench_path_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_path");
    for (width, depth) in [(10, 3), (4, 6)] {
        let (snapshot, files) = build(width, depth);
        let paths: Vec<PathBuf> = files
            .iter()
            .map(|id| snapshot.path(id).expect("resolvable").0)
            .collect();
        let label = format!("{}x{}", width, depth);

        group.bench_with_input(BenchmarkId::new("path", &label), &files, |b, files| {
            b.iter(|| {
                for id in files {
                    black_box(snapshot.path(black_box(id)).ok());
                }
            })
        });
        group.bench_with_input(BenchmarkId::new("id_from_path", &label), &paths, |b, paths| {
            b.iter(|| {
                for path in paths {
                    black_box(snapshot.id_from_path(black_box(path)));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_path_lookup);
criterion_main!(benches);
