// Distances between clusters of one equivalence class.
//
// Within a class the members are ordered (newest first), and each member owns a `DistanceRow`
// holding one edge to every member that comes after it.  So the distance between two members is
// stored exactly once, in the row of the one that comes first.  The row caches its smallest
// distance, and the edges themselves live in an `EdgePool` so that released edges are reused.
//
// "No distance" is represented by f64::INFINITY throughout.

use crate::metrics::{MetricVector, Reference};
use crate::store::ClusterId;

/// The normalized distance between two clusters with the given average vectors, each representing
/// `a_count` and `b_count` iterations.
///
/// Every metric contributes |a - b| / reference, and metrics that are exactly equal contribute
/// nothing (so the reference can be zero there).  The sum is then weighted by the confidence
/// multiplier m = 0.4 + 0.05 * (a_count + b_count), applied as is up to 1.0 and as sqrt(m) above
/// that.

pub fn cluster_distance(
    a_avg: &MetricVector,
    a_count: u32,
    b_avg: &MetricVector,
    b_count: u32,
    reference: &Reference,
) -> f64 {
    let mut distance = 0.0;
    for i in 0..a_avg.len() {
        let diff = a_avg[i] - b_avg[i];
        if diff == 0.0 {
            continue;
        }
        distance += diff.abs() / reference.values()[i];
    }

    let multiplier = 0.4 + 0.05 * (a_count as f64 + b_count as f64);
    if multiplier <= 1.0 {
        distance * multiplier
    } else {
        distance * multiplier.sqrt()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeId(usize);

/// Storage for distance values.  Acquire and release are O(1); released slots are handed out again
/// before the pool grows.

#[derive(Default)]
pub struct EdgePool {
    values: Vec<f64>,
    in_use: Vec<bool>,
    free: Vec<EdgeId>,
}

impl EdgePool {
    pub fn new() -> EdgePool {
        EdgePool::default()
    }

    pub fn acquire(&mut self, value: f64) -> EdgeId {
        match self.free.pop() {
            Some(id) => {
                self.values[id.0] = value;
                self.in_use[id.0] = true;
                id
            }
            None => {
                self.values.push(value);
                self.in_use.push(true);
                EdgeId(self.values.len() - 1)
            }
        }
    }

    /// Return an edge to the pool.  Releasing an edge twice is a bug and panics.

    pub fn release(&mut self, id: EdgeId) {
        assert!(self.in_use[id.0], "Distance edge {} released twice", id.0);
        self.in_use[id.0] = false;
        self.free.push(id);
    }

    pub fn value(&self, id: EdgeId) -> f64 {
        debug_assert!(self.in_use[id.0]);
        self.values[id.0]
    }

    pub fn set(&mut self, id: EdgeId, value: f64) {
        debug_assert!(self.in_use[id.0]);
        self.values[id.0] = value;
    }

    /// Number of edges currently handed out.

    pub fn live(&self) -> usize {
        self.values.len() - self.free.len()
    }

    /// Total number of edge slots ever allocated.

    pub fn capacity(&self) -> usize {
        self.values.len()
    }
}

/// The distances from one cluster to the members that follow it in its class, in member order,
/// with the cached minimum.  On ties the earliest edge is the minimum.

#[derive(Debug)]
pub struct DistanceRow {
    entries: Vec<(ClusterId, EdgeId)>,
    min_val: f64,
    min_pos: Option<EdgeId>,
}

impl Default for DistanceRow {
    fn default() -> DistanceRow {
        DistanceRow {
            entries: vec![],
            min_val: f64::INFINITY,
            min_pos: None,
        }
    }
}

impl DistanceRow {
    pub fn new() -> DistanceRow {
        DistanceRow::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn min_val(&self) -> f64 {
        self.min_val
    }

    pub fn min_edge(&self) -> Option<EdgeId> {
        self.min_pos
    }

    /// The cluster at the other end of the minimum edge.

    pub fn min_target(&self) -> Option<ClusterId> {
        let edge = self.min_pos?;
        self.entries.iter().find(|(_, e)| *e == edge).map(|(t, _)| *t)
    }

    pub fn targets(&self) -> impl Iterator<Item = ClusterId> + '_ {
        self.entries.iter().map(|(t, _)| *t)
    }

    pub fn distance_to(&self, pool: &EdgePool, target: ClusterId) -> Option<f64> {
        self.entries
            .iter()
            .find(|(t, _)| *t == target)
            .map(|(_, e)| pool.value(*e))
    }

    /// Append an edge to `target`.

    pub fn push(&mut self, pool: &mut EdgePool, target: ClusterId, value: f64) {
        let edge = pool.acquire(value);
        self.entries.push((target, edge));
        if value < self.min_val {
            self.min_val = value;
            self.min_pos = Some(edge);
        }
    }

    /// Change the distance to `target`, which must be in the row.

    pub fn set_distance(&mut self, pool: &mut EdgePool, target: ClusterId, value: f64) {
        let Some(&(_, edge)) = self.entries.iter().find(|(t, _)| *t == target) else {
            panic!("No distance edge to cluster {}", target.0);
        };
        pool.set(edge, value);
        if value < self.min_val {
            self.min_val = value;
            self.min_pos = Some(edge);
        } else if self.min_pos == Some(edge) {
            self.rescan(pool);
        }
    }

    /// Remove and release the edge to `target`, if there is one.

    pub fn remove_target(&mut self, pool: &mut EdgePool, target: ClusterId) {
        let Some(i) = self.entries.iter().position(|(t, _)| *t == target) else {
            return;
        };
        let (_, edge) = self.entries.remove(i);
        pool.release(edge);
        if self.min_pos == Some(edge) {
            self.rescan(pool);
        }
    }

    /// Recompute every distance in the row with `f` and rebuild the minimum.

    pub fn recompute<F>(&mut self, pool: &mut EdgePool, mut f: F)
    where
        F: FnMut(ClusterId) -> f64,
    {
        for (target, edge) in &self.entries {
            pool.set(*edge, f(*target));
        }
        self.rescan(pool);
    }

    /// Rebuild the cached minimum from the edges.

    pub fn rescan(&mut self, pool: &EdgePool) {
        self.min_val = f64::INFINITY;
        self.min_pos = None;
        for (_, edge) in &self.entries {
            let v = pool.value(*edge);
            if v < self.min_val {
                self.min_val = v;
                self.min_pos = Some(*edge);
            }
        }
    }

    /// Release all edges.

    pub fn clear(&mut self, pool: &mut EdgePool) {
        for (_, edge) in self.entries.drain(..) {
            pool.release(edge);
        }
        self.min_val = f64::INFINITY;
        self.min_pos = None;
    }
}

#[cfg(test)]
fn vector(values: &[f64]) -> MetricVector {
    let mut v = MetricVector::zeros(values.len());
    for (i, x) in values.iter().enumerate() {
        v[i] = *x;
    }
    v
}

#[test]
fn test_cluster_distance() {
    let mut reference = Reference::new(2);
    reference.update(&vector(&[10.0, 4.0]));
    let a = vector(&[20.0, 4.0]);
    let b = vector(&[10.0, 0.0]);

    assert!(cluster_distance(&a, 1, &a, 1, &reference) == 0.0);
    assert!(cluster_distance(&a, 7, &a, 9, &reference) == 0.0);

    // 10/10 + 4/4, times 0.4 + 0.05 * 2
    let d = cluster_distance(&a, 1, &b, 1, &reference);
    assert!((d - 1.0).abs() < 1e-12);
    assert!(d == cluster_distance(&b, 1, &a, 1, &reference));

    // m = 0.4 + 0.05 * 12 = 1.0 is still linear
    let d = cluster_distance(&a, 6, &b, 6, &reference);
    assert!((d - 2.0).abs() < 1e-12);

    // m = 0.4 + 0.05 * 32 = 2.0 is damped
    let d = cluster_distance(&a, 16, &b, 16, &reference);
    assert!((d - 2.0 * 2.0f64.sqrt()).abs() < 1e-12);
}

#[test]
fn test_edge_pool_reuse() {
    let mut pool = EdgePool::new();
    let e1 = pool.acquire(1.0);
    let e2 = pool.acquire(2.0);
    assert!(pool.live() == 2);
    pool.release(e1);
    assert!(pool.live() == 1);
    let e3 = pool.acquire(3.0);
    assert!(e3 == e1);
    assert!(pool.value(e3) == 3.0);
    assert!(pool.value(e2) == 2.0);
    assert!(pool.capacity() == 2);
}

#[test]
#[should_panic]
fn test_edge_double_release() {
    let mut pool = EdgePool::new();
    let e = pool.acquire(1.0);
    pool.release(e);
    pool.release(e);
}

#[test]
fn test_distance_row_minimum() {
    let mut pool = EdgePool::new();
    let mut row = DistanceRow::new();
    assert!(row.min_val() == f64::INFINITY);
    assert!(row.min_target().is_none());

    row.push(&mut pool, ClusterId(1), 5.0);
    row.push(&mut pool, ClusterId(2), 3.0);
    row.push(&mut pool, ClusterId(3), 3.0);
    row.push(&mut pool, ClusterId(4), 8.0);
    assert!(row.min_val() == 3.0);
    assert!(row.min_target() == Some(ClusterId(2)));

    // Raising the minimum falls back to the next earliest minimum
    row.set_distance(&mut pool, ClusterId(2), 9.0);
    assert!(row.min_target() == Some(ClusterId(3)));

    row.set_distance(&mut pool, ClusterId(4), 1.0);
    assert!(row.min_target() == Some(ClusterId(4)));
    assert!(row.min_val() == 1.0);

    row.remove_target(&mut pool, ClusterId(4));
    assert!(row.min_target() == Some(ClusterId(3)));
    assert!(row.len() == 3);
    assert!(pool.live() == 3);

    row.recompute(&mut pool, |t| t.0 as f64);
    assert!(row.min_target() == Some(ClusterId(1)));
    assert!(row.distance_to(&pool, ClusterId(3)) == Some(3.0));

    row.clear(&mut pool);
    assert!(pool.live() == 0);
    assert!(row.min_val() == f64::INFINITY);
}
