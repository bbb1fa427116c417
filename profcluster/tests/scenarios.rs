// End-to-end clustering runs through a `Clustering` session, checking the structural invariants of
// the clusterer after every iteration.

use profcluster::compare::call_trees_match;
use profcluster::config::{ClusterConfig, ClusterMode};
use profcluster::metrics::{iteration_metrics, Metric, MetricVector};
use profcluster::profile::{MetricHandle, NodeId, NodeKind, Paradigm, Profile, RegionHandle, RegionType};
use profcluster::{Clusterer, Clustering};

use std::collections::HashMap;

const SENT: MetricHandle = MetricHandle(0);
const RECEIVED: MetricHandle = MetricHandle(1);

// (region, visits, time, bytes sent)
type Call = (&'static str, u64, u64, u64);

struct Run {
    profile: Profile,
    session: Clustering,
    dynamic: NodeId,
    regions: HashMap<&'static str, RegionHandle>,
    completed: i64,
}

impl Run {
    fn new(cluster_count: u64, mode: u64) -> Run {
        let mut profile = Profile::new(0);
        profile.set_byte_metrics(SENT, RECEIVED);
        let mut regions = HashMap::new();
        for (name, paradigm, region_type) in [
            ("step", Paradigm::User, RegionType::Dynamic),
            ("compute", Paradigm::User, RegionType::Function),
            ("io", Paradigm::User, RegionType::Function),
            ("MPI_Send", Paradigm::Mpi, RegionType::PointToPoint),
            ("MPI_Probe", Paradigm::Mpi, RegionType::PointToPoint),
            ("MPI_Allreduce", Paradigm::Mpi, RegionType::CollAllToAll),
        ] {
            regions.insert(name, profile.define_region(name, paradigm, region_type));
        }
        let root = profile.add_root(NodeKind::ThreadRoot { thread_id: 0 });
        let dynamic = profile.add_child(root, NodeKind::RegularRegion(regions["step"]));

        let mut session = Clustering::initialize(ClusterConfig {
            cluster_count,
            mode,
            ..ClusterConfig::default()
        });
        session.on_enter_dynamic(&profile, dynamic, false);
        Run {
            profile,
            session,
            dynamic,
            regions,
            completed: 0,
        }
    }

    // Record one iteration with the given calls below the iteration root, without completing it.

    fn record(&mut self, time: u64, calls: &[Call]) -> NodeId {
        self.completed += 1;
        let node = self.profile.add_child(
            self.dynamic,
            NodeKind::ParameterInteger {
                parameter: 0,
                value: self.completed,
            },
        );
        self.profile.node_mut(node).count = 1;
        self.profile.node_mut(node).inclusive_time = time;
        for (region, visits, t, bytes) in calls {
            let c = self
                .profile
                .add_child(node, NodeKind::RegularRegion(self.regions[region]));
            self.profile.node_mut(c).count = *visits;
            self.profile.node_mut(c).inclusive_time = *t;
            if *bytes > 0 {
                self.profile.add_sparse_int(c, SENT, *visits, *bytes);
            }
        }
        node
    }

    fn complete(&mut self, node: NodeId) {
        self.session.on_iteration_complete(&mut self.profile, node);
    }

    fn iteration(&mut self, time: u64, calls: &[Call]) -> NodeId {
        let node = self.record(time, calls);
        self.complete(node);
        node
    }

    fn clusterer(&mut self) -> &mut Clusterer {
        self.session.clusterer_mut().unwrap()
    }
}

// Invariants 1-4 and the consistency of the distance bookkeeping.

fn check_invariants(c: &mut Clusterer) {
    let n = c.iterations().len();
    let mut per_cluster = HashMap::new();
    for i in 0..n {
        let cluster = c.cluster_of_iteration(i);
        assert!(c.store().is_live(cluster));
        let holding = c
            .store()
            .classes()
            .filter(|k| k.members().contains(&cluster))
            .count();
        assert!(holding == 1);
        *per_cluster.entry(cluster).or_insert(0u32) += 1;
    }

    let store = c.store();
    assert!(store.live_clusters() as u64 == c.cluster_count());
    assert!(per_cluster.len() == store.live_clusters());
    for (cluster, count) in &per_cluster {
        let data = store.cluster(*cluster);
        assert!(data.iteration_count == *count);
        for m in 0..data.mets_sum.len() {
            let avg = data.mets_sum[m] / data.iteration_count as f64;
            assert!((data.mets_avg[m] - avg).abs() <= 1e-9 * avg.abs().max(1.0));
        }
    }

    let mut edges = 0;
    let mut set_min = f64::INFINITY;
    for class in store.classes() {
        let mut class_min = f64::INFINITY;
        for (i, member) in class.members().iter().enumerate() {
            let row = store.cluster(*member).row();
            if row.is_empty() {
                continue;
            }
            // Every row covers exactly the members after its owner
            let targets = row.targets().collect::<Vec<_>>();
            assert!(targets.as_slice() == &class.members()[i + 1..]);
            let row_min = targets
                .iter()
                .map(|t| row.distance_to(store.edges(), *t).unwrap())
                .fold(f64::INFINITY, f64::min);
            assert!(row.min_val() == row_min);
            class_min = class_min.min(row_min);
            edges += targets.len();
        }
        assert!(class.min_val() == class_min);
        set_min = set_min.min(class_min);
    }
    assert!(store.min_val() == set_min);
    assert!(store.edges().live() == edges);
}

// Members of a class match the class head, and the heads of different classes do not match.

fn check_classes(profile: &Profile, c: &Clusterer) {
    let store = c.store();
    let matches = |a, b| {
        let (x, y) = (store.cluster(a), store.cluster(b));
        call_trees_match(profile, c.mode(), x.root, y.root, x.iteration_count, y.iteration_count)
    };
    let heads = store.classes().map(|k| k.members()[0]).collect::<Vec<_>>();
    for class in store.classes() {
        for m in class.members() {
            assert!(store.cluster(*m).hash == class.hash);
            assert!(matches(class.members()[0], *m));
        }
    }
    for (i, a) in heads.iter().enumerate() {
        for b in &heads[i + 1..] {
            assert!(!matches(*a, *b));
        }
    }
}

fn same_cluster(c: &mut Clusterer, a: usize, b: usize) -> bool {
    c.cluster_of_iteration(a) == c.cluster_of_iteration(b)
}

const SHAPE: [Call; 2] = [("compute", 1, 80, 0), ("MPI_Send", 2, 10, 512)];

#[test]
fn identical_iterations_share_one_class() {
    let mut run = Run::new(2, 1);
    for _ in 0..3 {
        run.iteration(100, &SHAPE);
    }
    let c = run.clusterer();
    check_invariants(c);
    assert!(c.store().class_count() == 1);
    assert!(c.cluster_count() == 2);
    assert!(c.relaxations() == 0);

    let mut run = Run::new(1, 1);
    for _ in 0..3 {
        run.iteration(100, &SHAPE);
    }
    let c = run.clusterer();
    check_invariants(c);
    assert!(c.cluster_count() == 1);
    let only = c.cluster_of_iteration(0);
    let cluster = c.store().cluster(only);
    assert!(cluster.iteration_count == 3);
    // Per iteration: the iteration node, compute and MPI_Send
    assert!(cluster.mets_sum[Metric::Visits] == 3.0 * (1.0 + 1.0 + 2.0));
    assert!(cluster.mets_avg[Metric::SendBytes] == 512.0);
}

#[test]
fn distinct_shapes_relax_the_budget() {
    let mut run = Run::new(1, 1);
    run.iteration(100, &[("compute", 1, 90, 0)]);
    run.iteration(100, &[("io", 1, 90, 0)]);
    {
        let c = run.clusterer();
        check_invariants(c);
        assert!(c.store().min_val() == f64::INFINITY);
        assert!(c.max_cluster_count() == 2);
        assert!(c.cluster_count() == 2);
        assert!(c.relaxations() == 1);
    }

    let n = run.session.postprocess(&mut run.profile);
    assert!(n == 2);
    let c = run.session.clusterer().unwrap();
    let mut ids = c
        .store()
        .classes()
        .flat_map(|k| k.members().iter().map(|m| c.store().cluster(*m).cluster_id))
        .collect::<Vec<_>>();
    ids.sort();
    assert!(ids == vec![1, 2]);
}

#[test]
fn closest_pair_is_merged() {
    let mut run = Run::new(2, 1);
    run.iteration(100, &[("compute", 1, 90, 0), ("MPI_Send", 1, 5, 0)]);
    run.iteration(100, &[("compute", 1, 90, 0), ("MPI_Send", 1, 5, 0)]);
    run.iteration(10, &[("compute", 1, 90, 0), ("MPI_Send", 1, 5, 1000)]);

    let c = run.clusterer();
    check_invariants(c);
    assert!(c.cluster_count() == 2);
    assert!(same_cluster(c, 0, 1));
    assert!(!same_cluster(c, 0, 2));
    // The newer of the two survives
    let merged = c.cluster_of_iteration(0);
    assert!(c.store().cluster(merged).cluster_id == 2);
}

#[test]
fn probe_visits_do_not_split_classes() {
    let mut run = Run::new(1, 2);
    run.iteration(100, &[("compute", 1, 90, 0), ("MPI_Probe", 3, 5, 0)]);
    run.iteration(100, &[("compute", 1, 90, 0), ("MPI_Probe", 17, 5, 0)]);
    let c = run.clusterer();
    check_invariants(c);
    assert!(c.store().class_count() == 1);
    assert!(c.cluster_count() == 1);

    // Without the exemption the visit counts matter in mode 2
    let mut run = Run::new(1, 2);
    run.iteration(100, &[("compute", 1, 90, 0), ("MPI_Send", 3, 5, 0)]);
    run.iteration(100, &[("compute", 1, 90, 0), ("MPI_Send", 17, 5, 0)]);
    let c = run.clusterer();
    assert!(c.store().class_count() == 2);
    assert!(c.relaxations() == 1);
}

#[test]
fn budget_holds_while_iterating() {
    let mut run = Run::new(3, 1);
    let times = [100, 300, 110, 500, 290, 120, 480];
    for (k, t) in times.iter().enumerate() {
        run.iteration(*t, &[("compute", 1, t - 10, 0), ("MPI_Allreduce", 1, 10, 8)]);
        let c = run.clusterer();
        check_invariants(c);
        if k >= 3 {
            assert!(c.cluster_count() <= 3);
            assert!(c.relaxations() == 0);
        }
    }
    check_classes(&run.profile, run.session.clusterer().unwrap());
    let c = run.clusterer();
    assert!(c.cluster_count() == 3);
    assert!(c.iteration_count() == 7);
    assert!(same_cluster(c, 0, 2));
    assert!(same_cluster(c, 3, 6));
}

#[test]
fn reference_is_the_mean_of_created_clusters() {
    let mut run = Run::new(2, 1);
    let times = [100, 250, 120, 400, 90];
    let mut sum: Option<MetricVector> = None;
    for t in times {
        let node = run.record(t, &[("compute", 1, t / 2, 0), ("MPI_Send", 1, 5, t * 10)]);
        let v = iteration_metrics(&run.profile, node);
        match &mut sum {
            Some(s) => s.add(&v),
            None => sum = Some(v),
        }
        run.complete(node);
    }
    let c = run.clusterer();
    check_invariants(c);
    assert!(c.cluster_count() == 2);
    let mean = MetricVector::average(&sum.unwrap(), times.len() as u32);
    let reference = c.reference();
    assert!(reference.count() == times.len() as u64);
    for m in 0..mean.len() {
        assert!((reference.values()[m] - mean[m]).abs() <= 1e-9 * mean[m].abs().max(1.0));
    }
}

#[test]
fn communication_mode_ignores_user_code() {
    let mut run = Run::new(1, 3);
    run.iteration(100, &[("compute", 1, 90, 0), ("MPI_Send", 1, 5, 64)]);
    run.iteration(100, &[("io", 4, 90, 0), ("MPI_Send", 1, 5, 64)]);
    let c = run.clusterer();
    check_invariants(c);
    assert!(c.mode() == ClusterMode::Communication);
    assert!(c.store().class_count() == 1);
    assert!(c.cluster_count() == 1);
}

#[test]
fn postprocess_numbers_densely() {
    let mut run = Run::new(3, 1);
    for t in [100, 300, 110, 500, 290, 120] {
        run.iteration(t, &[("compute", 1, t - 10, 0)]);
    }
    run.iteration(200, &[("io", 1, 190, 0)]);
    run.iteration(210, &[("io", 1, 200, 0)]);
    let n = run.session.postprocess(&mut run.profile);
    let c = run.session.clusterer().unwrap();
    assert!(n as u64 == c.cluster_count());
    assert!(c.store().class_count() == 2);
    check_classes(&run.profile, c);

    let mut seen = vec![];
    for class in c.store().classes() {
        for m in class.members() {
            let cluster = c.store().cluster(*m);
            assert!(run.profile.int_value(cluster.root) == cluster.cluster_id as u64);
            seen.push(cluster.cluster_id);
        }
    }
    assert!(seen == (1..=n).collect::<Vec<u32>>());

    // Disabled sessions leave the profile alone
    run.session.finalize();
    assert!(run.session.postprocess(&mut run.profile) == 0);
}
