// The live clusters, grouped into equivalence classes.
//
// Clusters are kept in a slot arena and addressed by `ClusterId`; freed slots are reused.  Every
// live cluster is a member of exactly one `EquivalenceClass`, the set of clusters whose call trees
// match.  Classes are kept in ascending order of structural hash, and several classes may share a
// hash when trees collide.  Within a class the newest cluster comes first.
//
// Once distances are being tracked, each cluster has a distance edge to every member after it in
// its class (see `distance.rs`), each class caches the smallest row minimum of its members, and
// the store caches the smallest class minimum.  A merge always combines the pair at the store
// minimum.  Classes are never removed, a merge only shrinks a class.

use crate::compare::call_trees_match;
use crate::config::ClusterMode;
use crate::disjoint::DisjointSets;
use crate::distance::{cluster_distance, DistanceRow, EdgePool};
use crate::metrics::{MetricVector, Reference};
use crate::profile::{NodeId, Profile};

use log::debug;

/// Index of a cluster slot.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub usize);

#[derive(Debug)]
pub struct Cluster {
    /// The iteration node that holds the (merged) call tree of the cluster.
    pub root: NodeId,

    /// Temporary id (number of the creating iteration) until postprocessing assigns the final one.
    pub cluster_id: u32,

    pub hash: u32,
    pub iteration_count: u32,
    pub mets_sum: MetricVector,
    pub mets_avg: MetricVector,

    /// Index of the disjoint-set root that owns this cluster.
    pub disjoint_set: usize,

    row: DistanceRow,
}

impl Cluster {
    pub fn new(root: NodeId, cluster_id: u32, disjoint_set: usize, metric_count: usize) -> Cluster {
        Cluster {
            root,
            cluster_id,
            hash: 0,
            iteration_count: 1,
            mets_sum: MetricVector::zeros(metric_count),
            mets_avg: MetricVector::zeros(metric_count),
            disjoint_set,
            row: DistanceRow::new(),
        }
    }

    pub fn row(&self) -> &DistanceRow {
        &self.row
    }
}

/// Slot arena for clusters with a stack of free slots.

#[derive(Default)]
pub struct ClusterSlab {
    slots: Vec<Option<Cluster>>,
    free: Vec<ClusterId>,
}

impl ClusterSlab {
    pub fn alloc(&mut self, cluster: Cluster) -> ClusterId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0] = Some(cluster);
                id
            }
            None => {
                self.slots.push(Some(cluster));
                ClusterId(self.slots.len() - 1)
            }
        }
    }

    pub fn release(&mut self, id: ClusterId) -> Cluster {
        match self.slots[id.0].take() {
            Some(c) => {
                self.free.push(id);
                c
            }
            None => panic!("Cluster slot {} released twice", id.0),
        }
    }

    pub fn get(&self, id: ClusterId) -> &Cluster {
        match &self.slots[id.0] {
            Some(c) => c,
            None => panic!("Access to freed cluster slot {}", id.0),
        }
    }

    pub fn get_mut(&mut self, id: ClusterId) -> &mut Cluster {
        match &mut self.slots[id.0] {
            Some(c) => c,
            None => panic!("Access to freed cluster slot {}", id.0),
        }
    }

    pub fn is_live(&self, id: ClusterId) -> bool {
        matches!(self.slots.get(id.0), Some(Some(_)))
    }

    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[derive(Debug)]
pub struct EquivalenceClass {
    pub hash: u32,
    members: Vec<ClusterId>,
    min_val: f64,
    min_pos: Option<ClusterId>,
}

impl EquivalenceClass {
    fn new(hash: u32, first: ClusterId) -> EquivalenceClass {
        EquivalenceClass {
            hash,
            members: vec![first],
            min_val: f64::INFINITY,
            min_pos: None,
        }
    }

    /// The clusters of the class, newest first.

    pub fn members(&self) -> &[ClusterId] {
        &self.members
    }

    pub fn min_val(&self) -> f64 {
        self.min_val
    }

    /// The member whose row holds the class minimum.

    pub fn min_pos(&self) -> Option<ClusterId> {
        self.min_pos
    }
}

pub struct ClusterStore {
    clusters: ClusterSlab,
    edges: EdgePool,
    classes: Vec<EquivalenceClass>,
    order: Vec<ClassId>,
    min_val: f64,
    min_pos: Option<ClassId>,
}

impl Default for ClusterStore {
    fn default() -> ClusterStore {
        ClusterStore {
            clusters: ClusterSlab::default(),
            edges: EdgePool::new(),
            classes: vec![],
            order: vec![],
            min_val: f64::INFINITY,
            min_pos: None,
        }
    }
}

impl ClusterStore {
    pub fn new() -> ClusterStore {
        ClusterStore::default()
    }

    pub fn alloc(&mut self, cluster: Cluster) -> ClusterId {
        self.clusters.alloc(cluster)
    }

    pub fn cluster(&self, id: ClusterId) -> &Cluster {
        self.clusters.get(id)
    }

    pub fn cluster_mut(&mut self, id: ClusterId) -> &mut Cluster {
        self.clusters.get_mut(id)
    }

    pub fn is_live(&self, id: ClusterId) -> bool {
        self.clusters.is_live(id)
    }

    pub fn live_clusters(&self) -> usize {
        self.clusters.live()
    }

    pub fn edges(&self) -> &EdgePool {
        &self.edges
    }

    pub fn class(&self, id: ClassId) -> &EquivalenceClass {
        &self.classes[id.0]
    }

    /// The classes in ascending hash order.

    pub fn classes(&self) -> impl Iterator<Item = &EquivalenceClass> + '_ {
        self.order.iter().map(|c| &self.classes[c.0])
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// The smallest distance between two clusters of one class; infinite if no merge is possible.

    pub fn min_val(&self) -> f64 {
        self.min_val
    }

    pub fn min_pos(&self) -> Option<ClassId> {
        self.min_pos
    }

    /// The class that holds `cluster`.

    pub fn class_of(&self, cluster: ClusterId) -> Option<ClassId> {
        self.order
            .iter()
            .copied()
            .find(|c| self.classes[c.0].members.contains(&cluster))
    }

    pub fn distance(&self, a: ClusterId, b: ClusterId, reference: &Reference) -> f64 {
        let x = self.clusters.get(a);
        let y = self.clusters.get(b);
        cluster_distance(&x.mets_avg, x.iteration_count, &y.mets_avg, y.iteration_count, reference)
    }

    /// Place the allocated cluster `id` in its equivalence class, creating the class if no class
    /// with the same hash has a matching call tree.  Only the newest member of a class is
    /// compared against.

    pub fn insert(&mut self, profile: &Profile, mode: ClusterMode, id: ClusterId) -> ClassId {
        let cluster = self.clusters.get(id);
        let hash = cluster.hash;

        let mut pos = self
            .order
            .iter()
            .position(|c| self.classes[c.0].hash >= hash)
            .unwrap_or(self.order.len());

        while pos < self.order.len() && self.classes[self.order[pos].0].hash == hash {
            let class = self.order[pos];
            let head = self.clusters.get(self.classes[class.0].members[0]);
            if call_trees_match(
                profile,
                mode,
                head.root,
                cluster.root,
                head.iteration_count,
                cluster.iteration_count,
            ) {
                self.classes[class.0].members.insert(0, id);
                return class;
            }
            pos += 1;
        }

        let class = ClassId(self.classes.len());
        self.classes.push(EquivalenceClass::new(hash, id));
        self.order.insert(pos, class);
        class
    }

    /// Give every cluster of every class its edges.  Used once, when the budget is first exceeded.

    pub fn compute_all_distances(&mut self, reference: &Reference) {
        for class in self.order.clone() {
            for id in self.classes[class.0].members.clone() {
                self.distances_for_new_cluster(id, class, reference);
            }
        }
    }

    /// Add edges from `id` to the members after it in `class`, and update the minima.

    pub fn distances_for_new_cluster(&mut self, id: ClusterId, class: ClassId, reference: &Reference) {
        let members = &self.classes[class.0].members;
        let Some(index) = members.iter().position(|m| *m == id) else {
            panic!("Cluster {} is not in class {}", id.0, class.0);
        };
        let distances = members[index + 1..]
            .iter()
            .map(|m| (*m, self.distance(id, *m, reference)))
            .collect::<Vec<(ClusterId, f64)>>();

        let cluster = self.clusters.get_mut(id);
        for (target, d) in distances {
            cluster.row.push(&mut self.edges, target, d);
        }

        let row_min = cluster.row.min_val();
        let class_data = &mut self.classes[class.0];
        if class_data.min_val > row_min {
            class_data.min_val = row_min;
            class_data.min_pos = Some(id);
            if self.min_val > row_min {
                self.min_val = row_min;
                self.min_pos = Some(class);
            }
        }
    }

    /// Merge the two clusters at the smallest distance of all, if there are any.  The one that
    /// comes first in its class survives and absorbs the other's metrics, call tree and iterations.
    /// Returns the (survivor, absorbed) pair.

    pub fn merge_least_distant_pair(
        &mut self,
        profile: &mut Profile,
        sets: &mut DisjointSets,
        reference: &Reference,
    ) -> Option<(ClusterId, ClusterId)> {
        if self.min_val == f64::INFINITY {
            return None;
        }
        let class = self.min_pos?;
        let a = self.classes[class.0].min_pos?;
        let b = self.clusters.get(a).row.min_target()?;
        debug!(
            "Merging cluster {} into {} at distance {}",
            self.clusters.get(b).cluster_id,
            self.clusters.get(a).cluster_id,
            self.min_val()
        );

        // Metrics
        let (b_root, b_set, b_count, b_sum) = {
            let cb = self.clusters.get(b);
            (cb.root, cb.disjoint_set, cb.iteration_count, cb.mets_sum.clone())
        };
        let ca = self.clusters.get_mut(a);
        ca.iteration_count += b_count;
        ca.mets_sum.add(&b_sum);
        ca.mets_avg = MetricVector::average(&ca.mets_sum, ca.iteration_count);
        let a_root = ca.root;
        let a_set = ca.disjoint_set;

        // Call trees and iterations
        profile.remove_node(b_root);
        profile.merge_subtree(a_root, b_root);
        let new_root = sets.union(a_set, b_set, a);
        self.clusters.get_mut(a).disjoint_set = new_root;

        // Edges of the members before a: the one to a changed, the one to b goes away
        let members = self.classes[class.0].members.clone();
        let (Some(index_a), Some(index_b)) = (
            members.iter().position(|m| *m == a),
            members.iter().position(|m| *m == b),
        ) else {
            panic!("Merge pair {}, {} is not in class {}", a.0, b.0, class.0);
        };
        for m in &members[..index_a] {
            let d = self.distance(*m, a, reference);
            let row = &mut self.clusters.get_mut(*m).row;
            row.set_distance(&mut self.edges, a, d);
            row.remove_target(&mut self.edges, b);
        }
        for m in &members[index_a..index_b] {
            self.clusters.get_mut(*m).row.remove_target(&mut self.edges, b);
        }

        let mut absorbed = self.clusters.release(b);
        absorbed.row.clear(&mut self.edges);
        self.classes[class.0].members.remove(index_b);

        // All of a's own edges changed
        let mut row = std::mem::take(&mut self.clusters.get_mut(a).row);
        let clusters = &self.clusters;
        row.recompute(&mut self.edges, |target| {
            let x = clusters.get(a);
            let y = clusters.get(target);
            cluster_distance(&x.mets_avg, x.iteration_count, &y.mets_avg, y.iteration_count, reference)
        });
        self.clusters.get_mut(a).row = row;

        self.rescan_class(class);
        self.rescan_classes();

        Some((a, b))
    }

    fn rescan_class(&mut self, class: ClassId) {
        let mut min_val = f64::INFINITY;
        let mut min_pos = None;
        for m in &self.classes[class.0].members {
            let v = self.clusters.get(*m).row.min_val();
            if min_val > v {
                min_val = v;
                min_pos = Some(*m);
            }
        }
        let c = &mut self.classes[class.0];
        c.min_val = min_val;
        c.min_pos = min_pos;
    }

    fn rescan_classes(&mut self) {
        let mut min_val = f64::INFINITY;
        let mut min_pos = None;
        for c in &self.order {
            let v = self.classes[c.0].min_val;
            if min_val > v {
                min_val = v;
                min_pos = Some(*c);
            }
        }
        self.min_val = min_val;
        self.min_pos = min_pos;
    }
}

#[cfg(test)]
use crate::profile::NodeKind;

// A store with one class per distinct `hash`, holding clusters with single-metric averages
// `values`, inserted in order.  Each cluster sits on its own iteration node of `profile`.

#[cfg(test)]
fn build_store(values: &[(u32, f64)]) -> (Profile, DisjointSets, Reference, ClusterStore, Vec<ClusterId>) {
    let mut profile = Profile::new(0);
    let root = profile.add_root(NodeKind::ThreadRoot { thread_id: 0 });
    let mut sets = DisjointSets::new();
    let mut reference = Reference::new(1);
    let mut store = ClusterStore::new();
    let mut ids = vec![];
    for (i, (hash, v)) in values.iter().enumerate() {
        let node = profile.add_child(root, NodeKind::ParameterInteger { parameter: 0, value: i as i64 });
        profile.node_mut(node).count = 1;
        let mut cluster = Cluster::new(node, i as u32 + 1, sets.len(), 1);
        cluster.hash = *hash;
        cluster.mets_sum[0] = *v;
        cluster.mets_avg[0] = *v;
        let id = store.alloc(cluster);
        sets.push(id);
        store.insert(&profile, ClusterMode::Off, id);
        reference.update(&store.cluster(id).mets_avg);
        ids.push(id);
    }
    (profile, sets, reference, store, ids)
}

#[test]
fn test_insert_order() {
    let (_, _, _, store, ids) = build_store(&[(5, 1.0), (2, 1.0), (5, 2.0), (9, 1.0)]);
    let hashes = store.classes().map(|c| c.hash).collect::<Vec<u32>>();
    assert!(hashes == vec![2, 5, 9]);
    let class = store.class_of(ids[0]).unwrap();
    assert!(store.class(class).members() == [ids[2], ids[0]]);
    assert!(store.min_val() == f64::INFINITY);
}

#[test]
fn test_merge_least_distant_pair() {
    let (mut profile, mut sets, reference, mut store, ids) =
        build_store(&[(1, 100.0), (1, 10.0), (1, 101.0), (1, 12.0), (2, 50.0)]);
    store.compute_all_distances(&reference);
    // Four members in class 1, a single one in class 2
    assert!(store.edges().live() == 6);
    let d = store.distance(ids[0], ids[2], &reference);
    assert!(store.min_val() == d);

    // Members are newest first: 12, 101, 10, 100.  The pair (101, 100) is closest and 101 comes
    // first, so it survives.
    let (a, b) = store.merge_least_distant_pair(&mut profile, &mut sets, &reference).unwrap();
    assert!(a == ids[2] && b == ids[0]);
    assert!(!store.is_live(b));
    assert!(store.live_clusters() == 4);
    assert!(store.edges().live() == 3);
    assert!(store.cluster(a).iteration_count == 2);
    assert!(store.cluster(a).mets_avg[0] == 100.5);
    assert!(sets.cluster_of(0) == a);
    assert!(sets.cluster_of(2) == a);
    assert!(profile.count(store.cluster(a).root) == 2);
    for row_owner in store.class(store.class_of(a).unwrap()).members() {
        assert!(store.cluster(*row_owner).row().targets().all(|t| t != b));
    }

    // Next closest is (12, 10)
    let (a, b) = store.merge_least_distant_pair(&mut profile, &mut sets, &reference).unwrap();
    assert!(a == ids[3] && b == ids[1]);
    assert!(store.edges().live() == 1);

    let (a, _) = store.merge_least_distant_pair(&mut profile, &mut sets, &reference).unwrap();
    assert!(a == ids[3]);
    assert!(store.cluster(a).iteration_count == 4);
    assert!(store.edges().live() == 0);
    assert!(store.min_val() == f64::INFINITY);
    assert!(store.merge_least_distant_pair(&mut profile, &mut sets, &reference).is_none());
}
