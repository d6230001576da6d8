use breedgraph_core::{DiGraph, EntryId, RelationshipId};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

/// A PARENT_OF-style hierarchy: a spine of `depth` entries, each with `fan_out` leaves.
fn hierarchy(depth: i64, fan_out: i64) -> DiGraph<EntryId, RelationshipId> {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut next_edge = 0;
    for level in 0..depth {
        let spine = EntryId(level * (fan_out + 1) + 1);
        nodes.push(spine);
        if level > 0 {
            next_edge += 1;
            edges.push((EntryId(spine.0 - fan_out - 1), spine, RelationshipId(next_edge)));
        }
        for leaf in 1..=fan_out {
            let leaf_id = EntryId(spine.0 + leaf);
            nodes.push(leaf_id);
            next_edge += 1;
            edges.push((spine, leaf_id, RelationshipId(next_edge)));
        }
    }
    match DiGraph::from_parts(nodes, edges) {
        Ok(graph) => graph,
        Err(err) => panic!("fixture graph is invalid: {err}"),
    }
}

fn bench_label_cycle_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("has_path_between_entries");
    for depth in [16_i64, 128, 512] {
        let graph = hierarchy(depth, 4);
        let top = EntryId(1);
        let bottom = EntryId((depth - 1) * 5 + 1);
        group.bench_with_input(BenchmarkId::new("reject_back_edge", depth), &graph, |b, graph| {
            b.iter(|| graph.has_path(top, bottom));
        });
        group.bench_with_input(BenchmarkId::new("accept_new_edge", depth), &graph, |b, graph| {
            b.iter(|| graph.has_path(bottom, top));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_label_cycle_check);
criterion_main!(benches);
