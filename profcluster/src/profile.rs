// The call-tree profile that the clusterer works on.
//
// Nodes live in an arena owned by `Profile` and are addressed by `NodeId`.  Each node has an ordered
// vector of children; the top-level nodes are thread roots, one per thread that has recorded
// anything.  When a thread forks worker threads, each worker's thread root gets a thread-start
// child that points back at the forking node, and the fork node is flagged with `is_fork`.
//
// Nodes are never freed.  A subtree that is merged into another one with `merge_subtree` is
// detached from the tree first (`remove_node`) and is unreachable afterwards.

use serde::Deserialize;
use std::cmp::Ordering;

/// Index of a node in the profile arena.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Index of a region definition in the profile.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionHandle(pub u32);

/// Handle of a sparse (event-specific) metric.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Paradigm {
    User,
    Compiler,
    Mpi,
    Openmp,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionType {
    Function,
    Loop,
    Dynamic,
    Barrier,
    CollOneToAll,
    CollAllToOne,
    CollAllToAll,
    CollOther,
    PointToPoint,
    Other,
}

#[derive(Clone, Debug)]
pub struct Region {
    pub name: String,
    pub paradigm: Paradigm,
    pub region_type: RegionType,
}

/// What a node stands for.  The variant order is the primary key of the canonical node order.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    RegularRegion(RegionHandle),
    ParameterString { parameter: u32, value: String },
    ParameterInteger { parameter: u32, value: i64 },
    ThreadRoot { thread_id: u64 },
    ThreadStart { fork: NodeId },
    Collapse { depth: u64 },
}

impl NodeKind {
    fn tag(&self) -> u8 {
        match self {
            NodeKind::RegularRegion(_) => 0,
            NodeKind::ParameterString { .. } => 1,
            NodeKind::ParameterInteger { .. } => 2,
            NodeKind::ThreadRoot { .. } => 3,
            NodeKind::ThreadStart { .. } => 4,
            NodeKind::Collapse { .. } => 5,
        }
    }
}

/// An integer-valued sparse metric attached to a node, eg bytes sent by an MPI call.  `count` is
/// the number of events, `sum` the accumulated value.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseMetric {
    pub metric: MetricHandle,
    pub count: u64,
    pub sum: u64,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,

    /// Visit count.
    pub count: u64,

    /// Sum of the inclusive time of all visits.
    pub inclusive_time: u64,

    /// Sums of the strictly synchronous metrics, indexed like `Profile::num_dense_metrics`.
    pub dense_metrics: Vec<u64>,

    pub sparse_int: Vec<SparseMetric>,

    /// True if a thread was forked at this node.
    pub is_fork: bool,

    /// Scratch flag computed while hashing: some node in the subtree is an MPI region.
    pub mpi_in_subtree: bool,

    /// Integer slot for type-specific data; the clusterer stores the final cluster number here.
    pub int_value: u64,
}

pub struct Profile {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
    regions: Vec<Region>,
    num_dense_metrics: usize,
    bytes_sent: Option<MetricHandle>,
    bytes_received: Option<MetricHandle>,
}

impl Profile {
    pub fn new(num_dense_metrics: usize) -> Profile {
        Profile {
            nodes: vec![],
            roots: vec![],
            regions: vec![],
            num_dense_metrics,
            bytes_sent: None,
            bytes_received: None,
        }
    }

    pub fn num_dense_metrics(&self) -> usize {
        self.num_dense_metrics
    }

    pub fn define_region(&mut self, name: &str, paradigm: Paradigm, region_type: RegionType) -> RegionHandle {
        self.regions.push(Region {
            name: name.to_string(),
            paradigm,
            region_type,
        });
        RegionHandle((self.regions.len() - 1) as u32)
    }

    pub fn region(&self, handle: RegionHandle) -> &Region {
        &self.regions[handle.0 as usize]
    }

    pub fn find_region(&self, name: &str) -> Option<RegionHandle> {
        self.regions
            .iter()
            .position(|r| r.name == name)
            .map(|i| RegionHandle(i as u32))
    }

    /// Register the sparse metrics that count MPI bytes sent and received.

    pub fn set_byte_metrics(&mut self, sent: MetricHandle, received: MetricHandle) {
        self.bytes_sent = Some(sent);
        self.bytes_received = Some(received);
    }

    pub fn bytes_sent_metric(&self) -> Option<MetricHandle> {
        self.bytes_sent
    }

    pub fn bytes_received_metric(&self) -> Option<MetricHandle> {
        self.bytes_received
    }

    fn new_node(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            parent,
            children: vec![],
            kind,
            count: 0,
            inclusive_time: 0,
            dense_metrics: vec![0; self.num_dense_metrics],
            sparse_int: vec![],
            is_fork: false,
            mpi_in_subtree: false,
            int_value: 0,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Add a new top-level node, normally a thread root.

    pub fn add_root(&mut self, kind: NodeKind) -> NodeId {
        let id = self.new_node(None, kind);
        self.roots.push(id);
        id
    }

    /// Append a new child to `parent`.

    pub fn add_child(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.new_node(Some(parent), kind);
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Record that worker thread `root` was forked at `fork`: this creates the thread-start node on
    /// that thread, below which the worker's call tree is recorded.

    pub fn add_thread_start(&mut self, root: NodeId, fork: NodeId) -> NodeId {
        self.nodes[fork.0].is_fork = true;
        self.add_child(root, NodeKind::ThreadStart { fork })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn count(&self, id: NodeId) -> u64 {
        self.nodes[id.0].count
    }

    pub fn int_value(&self, id: NodeId) -> u64 {
        self.nodes[id.0].int_value
    }

    pub fn set_int_value(&mut self, id: NodeId, value: u64) {
        self.nodes[id.0].int_value = value;
    }

    pub fn mpi_in_subtree(&self, id: NodeId) -> bool {
        self.nodes[id.0].mpi_in_subtree
    }

    pub fn set_mpi_in_subtree(&mut self, id: NodeId, value: bool) {
        self.nodes[id.0].mpi_in_subtree = value;
    }

    /// The region of a regular region node, None for all other node kinds.

    pub fn region_of(&self, id: NodeId) -> Option<&Region> {
        match self.nodes[id.0].kind {
            NodeKind::RegularRegion(handle) => Some(self.region(handle)),
            _ => None,
        }
    }

    pub fn is_mpi_node(&self, id: NodeId) -> bool {
        matches!(self.region_of(id), Some(r) if r.paradigm == Paradigm::Mpi)
    }

    pub fn is_fork_node(&self, id: NodeId) -> bool {
        self.nodes[id.0].is_fork
    }

    pub fn sparse_int(&self, id: NodeId, metric: MetricHandle) -> Option<&SparseMetric> {
        self.nodes[id.0].sparse_int.iter().find(|s| s.metric == metric)
    }

    /// Add a sample to a sparse metric of a node, creating the metric if necessary.

    pub fn add_sparse_int(&mut self, id: NodeId, metric: MetricHandle, count: u64, sum: u64) {
        let node = &mut self.nodes[id.0];
        if let Some(s) = node.sparse_int.iter_mut().find(|s| s.metric == metric) {
            s.count += count;
            s.sum += sum;
        } else {
            node.sparse_int.push(SparseMetric { metric, count, sum });
        }
    }

    /// The thread-start node below the thread root `root` that was forked at `fork`, if any.

    pub fn thread_start_for_fork(&self, root: NodeId, fork: NodeId) -> Option<NodeId> {
        self.children(root)
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].kind == NodeKind::ThreadStart { fork })
    }

    /// The thread-start nodes of all threads forked at `node`, in thread-root order.  Empty unless
    /// `node` is a fork node.

    pub fn fork_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let roots: &[NodeId] = if self.is_fork_node(node) { &self.roots } else { &[] };
        roots
            .iter()
            .filter_map(move |root| self.thread_start_for_fork(*root, node))
    }

    /// The children of `node` followed by the thread-start nodes of the threads forked at `node`.
    /// Walking this recursively visits the whole logical subtree of an iteration, across threads.

    pub fn children_with_forks(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children(node)
            .iter()
            .copied()
            .chain(self.fork_children(node))
    }

    /// Total order over node identity: node kind first, then the kind-specific data.

    pub fn node_order(&self, a: NodeId, b: NodeId) -> Ordering {
        let ka = &self.nodes[a.0].kind;
        let kb = &self.nodes[b.0].kind;
        match (ka, kb) {
            (NodeKind::RegularRegion(x), NodeKind::RegularRegion(y)) => x.cmp(y),
            (
                NodeKind::ParameterString { parameter: p1, value: v1 },
                NodeKind::ParameterString { parameter: p2, value: v2 },
            ) => (p1, v1).cmp(&(p2, v2)),
            (
                NodeKind::ParameterInteger { parameter: p1, value: v1 },
                NodeKind::ParameterInteger { parameter: p2, value: v2 },
            ) => (p1, v1).cmp(&(p2, v2)),
            (NodeKind::ThreadRoot { thread_id: x }, NodeKind::ThreadRoot { thread_id: y }) => x.cmp(y),
            (NodeKind::ThreadStart { fork: x }, NodeKind::ThreadStart { fork: y }) => x.cmp(y),
            (NodeKind::Collapse { depth: x }, NodeKind::Collapse { depth: y }) => x.cmp(y),
            _ => ka.tag().cmp(&kb.tag()),
        }
    }

    /// True if the two nodes have the same kind and kind-specific data.

    pub fn same_node(&self, a: NodeId, b: NodeId) -> bool {
        self.nodes[a.0].kind == self.nodes[b.0].kind
    }

    /// The intrinsic hash of a node, derived from its kind and kind-specific data only.

    pub fn node_hash(&self, id: NodeId) -> u32 {
        let kind = &self.nodes[id.0].kind;
        let seed = kind.tag() as u32;
        match kind {
            NodeKind::RegularRegion(handle) => jenkins_hash(&handle.0.to_le_bytes(), seed),
            NodeKind::ParameterString { parameter, value } => jenkins_hash(
                value.as_bytes(),
                jenkins_hash(&parameter.to_le_bytes(), seed),
            ),
            NodeKind::ParameterInteger { parameter, value } => jenkins_hash(
                &value.to_le_bytes(),
                jenkins_hash(&parameter.to_le_bytes(), seed),
            ),
            NodeKind::ThreadRoot { thread_id } => jenkins_hash(&thread_id.to_le_bytes(), seed),
            NodeKind::ThreadStart { fork } => jenkins_hash(&(fork.0 as u64).to_le_bytes(), seed),
            NodeKind::Collapse { depth } => jenkins_hash(&depth.to_le_bytes(), seed),
        }
    }

    /// Detach `node` with its subtree from its parent (or from the roots).

    pub fn remove_node(&mut self, node: NodeId) {
        match self.nodes[node.0].parent {
            Some(parent) => self.nodes[parent.0].children.retain(|c| *c != node),
            None => self.roots.retain(|r| *r != node),
        }
        self.nodes[node.0].parent = None;
    }

    /// Add the metrics of `source` into `destination` and merge the children recursively: a child
    /// of `source` with no matching child in `destination` is moved there, otherwise the two
    /// children are merged.  Threads forked at `source` are merged into the threads forked at
    /// `destination` the same way.  `source` should have been detached with `remove_node`.

    pub fn merge_subtree(&mut self, destination: NodeId, source: NodeId) {
        self.merge_node_metrics(destination, source);

        let children = std::mem::take(&mut self.nodes[source.0].children);
        for child in children {
            let matching = self.nodes[destination.0]
                .children
                .iter()
                .copied()
                .find(|c| self.same_node(*c, child));
            match matching {
                Some(m) => self.merge_subtree(m, child),
                None => {
                    self.nodes[child.0].parent = Some(destination);
                    self.nodes[destination.0].children.push(child);
                }
            }
        }

        if self.is_fork_node(source) {
            self.nodes[destination.0].is_fork = true;
            for root in self.roots.clone() {
                let Some(src_start) = self.thread_start_for_fork(root, source) else {
                    continue;
                };
                match self.thread_start_for_fork(root, destination) {
                    Some(dst_start) => {
                        self.remove_node(src_start);
                        self.merge_subtree(dst_start, src_start);
                    }
                    None => {
                        self.nodes[src_start.0].kind = NodeKind::ThreadStart { fork: destination };
                    }
                }
            }
        }
    }

    fn merge_node_metrics(&mut self, destination: NodeId, source: NodeId) {
        let src = self.nodes[source.0].clone();
        let dst = &mut self.nodes[destination.0];
        dst.count += src.count;
        dst.inclusive_time += src.inclusive_time;
        for (d, s) in dst.dense_metrics.iter_mut().zip(src.dense_metrics.iter()) {
            *d += *s;
        }
        for s in src.sparse_int {
            self.add_sparse_int(destination, s.metric, s.count, s.sum);
        }
    }

    /// All nodes reachable from the roots, in preorder.

    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = vec![];
        let mut stack = self.roots.iter().rev().copied().collect::<Vec<NodeId>>();
        while let Some(n) = stack.pop() {
            order.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        order
    }
}

/// Bob Jenkins' one-at-a-time hash, chained through `initval`.

pub fn jenkins_hash(bytes: &[u8], initval: u32) -> u32 {
    let mut hash = initval;
    for b in bytes {
        hash = hash.wrapping_add(*b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

#[cfg(test)]
fn small_profile() -> (Profile, NodeId, RegionHandle, RegionHandle) {
    let mut p = Profile::new(1);
    let foo = p.define_region("foo", Paradigm::User, RegionType::Function);
    let send = p.define_region("MPI_Send", Paradigm::Mpi, RegionType::PointToPoint);
    let root = p.add_root(NodeKind::ThreadRoot { thread_id: 0 });
    (p, root, foo, send)
}

#[test]
fn test_node_order() {
    let (mut p, root, foo, send) = small_profile();
    let a = p.add_child(root, NodeKind::RegularRegion(send));
    let b = p.add_child(root, NodeKind::RegularRegion(foo));
    let c = p.add_child(root, NodeKind::ParameterInteger { parameter: 0, value: 1 });
    assert!(p.node_order(b, a) == Ordering::Less);
    assert!(p.node_order(a, c) == Ordering::Less);
    assert!(p.node_order(c, c) == Ordering::Equal);
    assert!(p.same_node(a, a));
    assert!(!p.same_node(a, b));
    assert!(p.node_hash(a) != p.node_hash(b));
    assert!(p.is_mpi_node(a));
    assert!(!p.is_mpi_node(b));
}

#[test]
fn test_merge_subtree() {
    let (mut p, root, foo, send) = small_profile();
    let x = p.add_child(root, NodeKind::ParameterInteger { parameter: 0, value: 1 });
    let y = p.add_child(root, NodeKind::ParameterInteger { parameter: 0, value: 2 });
    let xs = p.add_child(x, NodeKind::RegularRegion(send));
    p.node_mut(xs).count = 2;
    p.add_sparse_int(xs, MetricHandle(0), 2, 100);
    let ys = p.add_child(y, NodeKind::RegularRegion(send));
    p.node_mut(ys).count = 3;
    p.add_sparse_int(ys, MetricHandle(0), 3, 50);
    let yf = p.add_child(y, NodeKind::RegularRegion(foo));

    p.remove_node(y);
    assert!(p.children(root) == [x]);
    p.merge_subtree(x, y);

    assert!(p.children(x).len() == 2);
    assert!(p.count(xs) == 5);
    assert!(p.sparse_int(xs, MetricHandle(0)) == Some(&SparseMetric { metric: MetricHandle(0), count: 5, sum: 150 }));
    assert!(p.parent(yf) == Some(x));
}

#[test]
fn test_fork_children() {
    let (mut p, root, foo, _send) = small_profile();
    let worker = p.add_root(NodeKind::ThreadRoot { thread_id: 1 });
    let it = p.add_child(root, NodeKind::ParameterInteger { parameter: 0, value: 1 });
    let par = p.add_child(it, NodeKind::RegularRegion(foo));
    let start = p.add_thread_start(worker, par);
    assert!(p.is_fork_node(par));
    assert!(p.thread_start_for_fork(worker, par) == Some(start));
    assert!(p.thread_start_for_fork(root, par).is_none());
    assert!(p.fork_children(par).collect::<Vec<NodeId>>() == vec![start]);
    assert!(p.children_with_forks(it).collect::<Vec<NodeId>>() == vec![par]);
    assert!(p.children_with_forks(par).collect::<Vec<NodeId>>() == vec![start]);
}
