// Copyright 2026 pathspace contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pathspace::{InsertOptions, PathSpaceBase, ReadOptions};
use pathspace_core::match_names;

fn bench_match_names(c: &mut Criterion) {
    let cases = [
        ("*", "anything"),
        ("foo*bar", "foo_middle_bar"),
        ("[abc]*", "bzzz"),
        ("a/b/c", "a/b/c"),
    ];
    c.bench_function("match_names", |b| {
        b.iter(|| {
            for (pattern, name) in cases.iter() {
                black_box(match_names(black_box(pattern), black_box(name)));
            }
        })
    });
}

fn bench_glob_read(c: &mut Criterion) {
    let space = pathspace::PathSpace::new();
    for i in 0..1000 {
        space.insert(&format!("/items/{}", i), i as i64, InsertOptions::default());
    }

    c.bench_function("glob_read_1000_children", |b| {
        b.iter(|| {
            let _ = black_box(space.out_raw("/items/*", false, &ReadOptions::non_blocking(), None));
        })
    });
}

criterion_group!(benches, bench_match_names, bench_glob_read);
criterion_main!(benches);
