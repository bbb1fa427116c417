// Metric vectors for cluster distance computation.
//
// A vector has a fixed prefix of derived metrics (the `Metric` enum, in order) followed by one
// entry per strictly synchronous dense metric of the measurement.  The derived metrics are
// computed by walking an iteration's call tree, including the subtrees of forked threads.

use crate::profile::{NodeId, Profile, RegionType};

use std::ops::{Index, IndexMut};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    ExecutionTime,
    Visits,
    MpiTime,
    MpiCollSyncTime,
    MpiCommTime,
    MpiP2pCommTime,
    MpiCollCommTime,
    CollBytesSent,
    CollBytesReceived,
    CollSyncs,
    SendBytes,
    SendComms,
    RecvBytes,
    RecvComms,
    P2pBytes,
    CollBytes,
    Bytes,
    P2pComm,
    CollComm,
    Comm,
}

/// Index of the first dense metric in a metric vector.

pub const DENSE_START: usize = Metric::Comm as usize + 1;

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::ExecutionTime => "time",
            Metric::Visits => "visits",
            Metric::MpiTime => "mpi_time",
            Metric::MpiCollSyncTime => "mpi_coll_sync_time",
            Metric::MpiCommTime => "mpi_comm_time",
            Metric::MpiP2pCommTime => "mpi_p2p_comm_time",
            Metric::MpiCollCommTime => "mpi_coll_comm_time",
            Metric::CollBytesSent => "coll_bytes_sent",
            Metric::CollBytesReceived => "coll_bytes_received",
            Metric::CollSyncs => "coll_syncs",
            Metric::SendBytes => "send_bytes",
            Metric::SendComms => "send_comms",
            Metric::RecvBytes => "recv_bytes",
            Metric::RecvComms => "recv_comms",
            Metric::P2pBytes => "p2p_bytes",
            Metric::CollBytes => "coll_bytes",
            Metric::Bytes => "bytes",
            Metric::P2pComm => "p2p_comm",
            Metric::CollComm => "coll_comm",
            Metric::Comm => "comm",
        }
    }
}

/// Number of entries in a metric vector for a measurement with `num_dense` dense metrics.

pub fn metric_count(num_dense: usize) -> usize {
    DENSE_START + num_dense
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricVector {
    values: Vec<f64>,
}

impl MetricVector {
    pub fn zeros(len: usize) -> MetricVector {
        MetricVector {
            values: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn add(&mut self, other: &MetricVector) {
        for (a, b) in self.values.iter_mut().zip(other.values.iter()) {
            *a += *b;
        }
    }

    /// `sum / count`, elementwise.

    pub fn average(sum: &MetricVector, count: u32) -> MetricVector {
        let n = count as f64;
        MetricVector {
            values: sum.values.iter().map(|v| *v / n).collect(),
        }
    }
}

impl Index<usize> for MetricVector {
    type Output = f64;
    fn index(&self, i: usize) -> &f64 {
        &self.values[i]
    }
}

impl IndexMut<usize> for MetricVector {
    fn index_mut(&mut self, i: usize) -> &mut f64 {
        &mut self.values[i]
    }
}

impl Index<Metric> for MetricVector {
    type Output = f64;
    fn index(&self, m: Metric) -> &f64 {
        &self.values[m as usize]
    }
}

impl IndexMut<Metric> for MetricVector {
    fn index_mut(&mut self, m: Metric) -> &mut f64 {
        &mut self.values[m as usize]
    }
}

/// The running average of the average vectors of all clusters ever created, used to normalize
/// metric differences.  Merges do not touch it.

#[derive(Clone, Debug)]
pub struct Reference {
    values: MetricVector,
    count: u64,
}

impl Reference {
    pub fn new(len: usize) -> Reference {
        Reference {
            values: MetricVector::zeros(len),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn values(&self) -> &MetricVector {
        &self.values
    }

    /// Fold in the average vector of a newly created cluster.

    pub fn update(&mut self, avg: &MetricVector) {
        let count = self.count as f64;
        for i in 0..self.values.len() {
            self.values[i] *= count / (count + 1.0);
            self.values[i] += avg[i] / (count + 1.0);
        }
        self.count += 1;
    }
}

/// Compute the metric vector of a single iteration rooted at `root`.

pub fn iteration_metrics(profile: &Profile, root: NodeId) -> MetricVector {
    let mut sum = MetricVector::zeros(metric_count(profile.num_dense_metrics()));
    accumulate_subtree(profile, root, &mut sum);
    post_process(profile, root, &mut sum);
    sum
}

// Visits of every node, and MPI time/bytes/counts by communication kind.

fn accumulate_subtree(profile: &Profile, node: NodeId, sum: &mut MetricVector) {
    let n = profile.node(node);
    sum[Metric::Visits] += n.count as f64;

    if profile.is_mpi_node(node) {
        if let Some(region) = profile.region_of(node) {
            let visits = n.count as f64;
            let time = n.inclusive_time as f64;
            let sent = profile
                .bytes_sent_metric()
                .and_then(|m| profile.sparse_int(node, m));
            let received = profile
                .bytes_received_metric()
                .and_then(|m| profile.sparse_int(node, m));

            sum[Metric::MpiTime] += time;
            match region.region_type {
                RegionType::Barrier => {
                    sum[Metric::MpiCollSyncTime] += time;
                    sum[Metric::CollSyncs] += visits;
                }
                RegionType::CollOneToAll
                | RegionType::CollAllToOne
                | RegionType::CollAllToAll
                | RegionType::CollOther => {
                    sum[Metric::MpiCollCommTime] += time;
                    sum[Metric::CollComm] += visits;
                    if let Some(s) = sent {
                        sum[Metric::CollBytesSent] += s.sum as f64;
                    }
                    if let Some(r) = received {
                        sum[Metric::CollBytesReceived] += r.sum as f64;
                    }
                }
                RegionType::PointToPoint => {
                    sum[Metric::MpiP2pCommTime] += time;
                    sum[Metric::P2pComm] += visits;
                    if let Some(s) = sent {
                        sum[Metric::SendBytes] += s.sum as f64;
                        sum[Metric::SendComms] += s.count as f64;
                    }
                    if let Some(r) = received {
                        sum[Metric::RecvBytes] += r.sum as f64;
                        sum[Metric::RecvComms] += r.count as f64;
                    }
                }
                _ => {
                    sum[Metric::MpiTime] += time;
                }
            }
        }
    }

    for child in profile.children_with_forks(node) {
        accumulate_subtree(profile, child, sum);
    }
}

// Totals that are sums of other metrics, the root's time, and the dense metrics.

fn post_process(profile: &Profile, root: NodeId, sum: &mut MetricVector) {
    let r = profile.node(root);
    sum[Metric::ExecutionTime] = r.inclusive_time as f64;

    sum[Metric::MpiCommTime] = sum[Metric::MpiP2pCommTime] + sum[Metric::MpiCollCommTime];
    sum[Metric::MpiTime] += sum[Metric::MpiCommTime] + sum[Metric::MpiCollSyncTime];
    sum[Metric::P2pBytes] = sum[Metric::SendBytes] + sum[Metric::RecvBytes];
    sum[Metric::CollBytes] = sum[Metric::CollBytesReceived] + sum[Metric::CollBytesSent];
    sum[Metric::Bytes] = sum[Metric::P2pBytes] + sum[Metric::CollBytes];
    sum[Metric::CollComm] += sum[Metric::CollSyncs];
    sum[Metric::Comm] = sum[Metric::P2pComm] + sum[Metric::CollComm];

    for (k, v) in r.dense_metrics.iter().enumerate() {
        sum[DENSE_START + k] = *v as f64;
    }
}

#[test]
fn test_reference_update() {
    let mut r = Reference::new(2);
    let mut v = MetricVector::zeros(2);
    v[0] = 10.0;
    v[1] = 1.0;
    r.update(&v);
    v[0] = 20.0;
    v[1] = 3.0;
    r.update(&v);
    v[0] = 60.0;
    v[1] = 5.0;
    r.update(&v);
    assert!(r.count() == 3);
    assert!((r.values()[0] - 30.0).abs() < 1e-9);
    assert!((r.values()[1] - 3.0).abs() < 1e-9);
}

#[test]
fn test_iteration_metrics() {
    use crate::profile::{MetricHandle, NodeKind, Paradigm};

    let mut p = Profile::new(1);
    p.set_byte_metrics(MetricHandle(0), MetricHandle(1));
    let compute = p.define_region("compute", Paradigm::User, RegionType::Function);
    let send = p.define_region("MPI_Send", Paradigm::Mpi, RegionType::PointToPoint);
    let recv = p.define_region("MPI_Recv", Paradigm::Mpi, RegionType::PointToPoint);
    let bcast = p.define_region("MPI_Bcast", Paradigm::Mpi, RegionType::CollOneToAll);
    let barrier = p.define_region("MPI_Barrier", Paradigm::Mpi, RegionType::Barrier);

    let root = p.add_root(NodeKind::ThreadRoot { thread_id: 0 });
    let it = p.add_child(root, NodeKind::ParameterInteger { parameter: 0, value: 1 });
    p.node_mut(it).count = 1;
    p.node_mut(it).inclusive_time = 1000;
    p.node_mut(it).dense_metrics[0] = 77;
    let c = p.add_child(it, NodeKind::RegularRegion(compute));
    p.node_mut(c).count = 2;
    p.node_mut(c).inclusive_time = 500;
    let s = p.add_child(c, NodeKind::RegularRegion(send));
    p.node_mut(s).count = 4;
    p.node_mut(s).inclusive_time = 40;
    p.add_sparse_int(s, MetricHandle(0), 4, 4096);
    let r = p.add_child(it, NodeKind::RegularRegion(recv));
    p.node_mut(r).count = 3;
    p.node_mut(r).inclusive_time = 30;
    p.add_sparse_int(r, MetricHandle(1), 3, 300);
    let b = p.add_child(it, NodeKind::RegularRegion(bcast));
    p.node_mut(b).count = 1;
    p.node_mut(b).inclusive_time = 20;
    p.add_sparse_int(b, MetricHandle(0), 1, 8);
    p.add_sparse_int(b, MetricHandle(1), 1, 16);
    let y = p.add_child(it, NodeKind::RegularRegion(barrier));
    p.node_mut(y).count = 2;
    p.node_mut(y).inclusive_time = 10;

    let m = iteration_metrics(&p, it);
    assert!(m.len() == DENSE_START + 1);
    assert!(m[Metric::ExecutionTime] == 1000.0);
    assert!(m[Metric::Visits] == 1.0 + 2.0 + 4.0 + 3.0 + 1.0 + 2.0);
    assert!(m[Metric::MpiP2pCommTime] == 70.0);
    assert!(m[Metric::MpiCollCommTime] == 20.0);
    assert!(m[Metric::MpiCollSyncTime] == 10.0);
    assert!(m[Metric::MpiCommTime] == 90.0);
    // Accumulated 100 while walking, then comm and sync time once more.
    assert!(m[Metric::MpiTime] == 100.0 + 90.0 + 10.0);
    assert!(m[Metric::SendBytes] == 4096.0);
    assert!(m[Metric::SendComms] == 4.0);
    assert!(m[Metric::RecvBytes] == 300.0);
    assert!(m[Metric::RecvComms] == 3.0);
    assert!(m[Metric::P2pBytes] == 4396.0);
    assert!(m[Metric::CollBytes] == 24.0);
    assert!(m[Metric::Bytes] == 4420.0);
    assert!(m[Metric::P2pComm] == 7.0);
    assert!(m[Metric::CollComm] == 1.0 + 2.0);
    assert!(m[Metric::Comm] == 10.0);
    assert!(m[DENSE_START] == 77.0);
}
