// Disjoint sets of clustered iterations.
//
// Every completed iteration becomes a `ClusteredIteration`.  The iterations that have been merged
// into one cluster form a tree through their `parent` links; the root of that tree owns the live
// cluster.  Only the root is ever asked for its cluster, so nothing here enumerates the members of
// a set.
//
// Iterations are stored in creation order, which doubles as the "all iterations" list.

use crate::store::ClusterId;

#[derive(Clone, Debug)]
pub struct ClusteredIteration {
    /// 1-based, in creation order.
    pub iteration_id: u32,
    rank: u32,
    parent: Option<usize>,
    cluster: Option<ClusterId>,
}

impl ClusteredIteration {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Default)]
pub struct DisjointSets {
    iterations: Vec<ClusteredIteration>,
}

impl DisjointSets {
    pub fn new() -> DisjointSets {
        DisjointSets { iterations: vec![] }
    }

    /// Register a new iteration as a singleton set owning `cluster`.  Returns its index.

    pub fn push(&mut self, cluster: ClusterId) -> usize {
        let index = self.iterations.len();
        self.iterations.push(ClusteredIteration {
            iteration_id: index as u32 + 1,
            rank: 0,
            parent: None,
            cluster: Some(cluster),
        });
        index
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    pub fn get(&self, index: usize) -> &ClusteredIteration {
        &self.iterations[index]
    }

    /// The root of the set containing `index`.  Every iteration visited on the way is linked
    /// directly to the root.

    pub fn find(&mut self, index: usize) -> usize {
        let mut root = index;
        while let Some(p) = self.iterations[root].parent {
            root = p;
        }
        let mut i = index;
        while let Some(p) = self.iterations[i].parent {
            if p != root {
                self.iterations[i].parent = Some(root);
            }
            i = p;
        }
        root
    }

    /// Merge the sets containing `a` and `b` by rank; on equal ranks the root of `a` wins and its
    /// rank grows.  The new root owns `cluster`, which the caller must point back at the returned
    /// root.  `a` and `b` must be in different sets.

    pub fn union(&mut self, a: usize, b: usize, cluster: ClusterId) -> usize {
        let mut a = self.find(a);
        let mut b = self.find(b);
        debug_assert!(a != b);
        if self.iterations[a].rank < self.iterations[b].rank {
            std::mem::swap(&mut a, &mut b);
        } else if self.iterations[a].rank == self.iterations[b].rank {
            self.iterations[a].rank += 1;
        }
        self.iterations[b].parent = Some(a);
        self.iterations[b].cluster = None;
        self.iterations[a].cluster = Some(cluster);
        a
    }

    /// The live cluster that iteration `index` belongs to.

    pub fn cluster_of(&mut self, index: usize) -> ClusterId {
        let root = self.find(index);
        match self.iterations[root].cluster {
            Some(c) => c,
            None => panic!("Disjoint set root {root} has no cluster"),
        }
    }
}

#[test]
fn test_union_find() {
    let mut sets = DisjointSets::new();
    for i in 0..5 {
        assert!(sets.push(ClusterId(i)) == i);
    }
    assert!(sets.get(3).iteration_id == 4);
    assert!(sets.find(2) == 2);

    // Equal ranks: a's root wins.
    let r = sets.union(0, 1, ClusterId(0));
    assert!(r == 0);
    assert!(sets.cluster_of(1) == ClusterId(0));
    assert!(!sets.get(1).is_root());

    // Higher rank wins regardless of argument order.
    let r = sets.union(2, 1, ClusterId(7));
    assert!(r == 0);
    assert!(sets.cluster_of(2) == ClusterId(7));
    assert!(sets.cluster_of(0) == ClusterId(7));
    assert!(sets.cluster_of(4) == ClusterId(4));

    // Path compression
    let r = sets.union(3, 4, ClusterId(3));
    assert!(r == 3);
    let r = sets.union(4, 2, ClusterId(9));
    assert!(r == 3);
    for i in 0..5 {
        assert!(sets.cluster_of(i) == ClusterId(9));
    }
    // 1 -> 0 -> 3 before the lookup above, 1 -> 3 after
    assert!(sets.iterations[1].parent == Some(3));
}
