use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::warn;

use crate::revision::Package;

/// Find the cheapest package chain from revision `from` to revision `to`,
/// minimizing the total package size.
///
/// Nodes are the revision ids appearing in any package plus the two
/// endpoints. Every package is a directed edge weighted by its size; a
/// complete-install package (empty `from`) is treated as an edge out of the
/// queried start node, so it can substitute for any starting point.
///
/// Equal-cost paths are broken deterministically: the lexicographically
/// smaller revision id is settled first.
///
/// Returns an empty chain when `from == to`, and an empty chain (with a
/// warning) when `to` is unreachable.
pub fn find_path(packages: &[Package], from: &str, to: &str) -> Vec<Package> {
    if from == to {
        return Vec::new();
    }

    // Adjacency: node -> [(package index, target)]
    let mut edges: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, package) in packages.iter().enumerate() {
        let origin = if package.is_complete() {
            from
        } else {
            package.from.as_str()
        };
        edges.entry(origin).or_default().push(idx);
    }

    let mut dist: HashMap<&str, u64> = HashMap::new();
    let mut prev: HashMap<&str, usize> = HashMap::new();
    let mut heap: BinaryHeap<Reverse<(u64, &str)>> = BinaryHeap::new();

    dist.insert(from, 0);
    heap.push(Reverse((0, from)));

    while let Some(Reverse((cost, node))) = heap.pop() {
        if cost > *dist.get(node).unwrap_or(&u64::MAX) {
            continue; // stale heap entry
        }
        if node == to {
            break;
        }
        let Some(outgoing) = edges.get(node) else {
            continue;
        };
        for &idx in outgoing {
            let package = &packages[idx];
            let next = package.to.as_str();
            let next_cost = cost.saturating_add(package.size);
            // Strictly-less relaxation: on equal cost the path through the
            // node settled first (lexicographically smaller, per the heap
            // ordering) keeps the edge.
            if next_cost < dist.get(next).copied().unwrap_or(u64::MAX) {
                dist.insert(next, next_cost);
                prev.insert(next, idx);
                heap.push(Reverse((next_cost, next)));
            }
        }
    }

    if !dist.contains_key(to) {
        warn!(from, to, "no package path between revisions");
        return Vec::new();
    }

    // Walk predecessor links backward from the target.
    let mut chain = Vec::new();
    let mut node = to;
    while node != from {
        let idx = prev[node];
        chain.push(packages[idx].clone());
        node = relax_origin(packages, idx, from);
    }
    chain.reverse();
    chain
}

fn relax_origin<'a>(packages: &'a [Package], idx: usize, from: &'a str) -> &'a str {
    if packages[idx].is_complete() {
        from
    } else {
        packages[idx].from.as_str()
    }
}

/// Total byte cost of a chain.
pub fn chain_size(chain: &[Package]) -> u64 {
    chain.iter().map(|p| p.size).sum()
}
