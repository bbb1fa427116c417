// Online clustering of the iterations of one dynamic region.
//
// A `Clustering` is the per-process session: it decides which dynamic region is clustered, creates
// the `Clusterer` lazily when the first iteration of that region completes, and feeds it every
// further completed iteration.  The `Clusterer` holds at most `max_cl_count` clusters; when a new
// iteration pushes it over the budget, the two closest clusters with matching call trees are
// merged.  If no two clusters have matching call trees the budget is raised by one instead.
//
// Distances are only tracked once the budget has been exceeded for the first time, so that the
// reference vector has as many samples as possible when the first distances are computed.
//
// All mutation goes through `&mut Clusterer`, so the store, edges and clusters need no locks of
// their own; only the ingestion queue is shared.

use crate::collective::Collective;
use crate::compare::{cluster_hash, sort_subtree};
use crate::config::{ClusterConfig, ClusterMode};
use crate::disjoint::DisjointSets;
use crate::export::{self, MappingWriter};
use crate::metrics::{iteration_metrics, metric_count, Reference};
use crate::profile::{NodeId, Profile};
use crate::queue::ClusterQueue;
use crate::store::{Cluster, ClusterId, ClusterStore};

use chrono::{Duration, Utc};
use log::{trace, warn};

pub struct Clusterer {
    mode: ClusterMode,
    max_cl_count: u64,
    cl_count: u64,
    cl_it_count: u64,
    metric_count: usize,
    iterations: DisjointSets,
    store: ClusterStore,
    reference: Reference,
    queue: ClusterQueue,
    distances_initialized: bool,
    relaxations: u64,
    clustering_time: Duration,
}

impl Clusterer {
    pub fn new(max_cl_count: u64, mode: ClusterMode, num_dense_metrics: usize) -> Clusterer {
        let metric_count = metric_count(num_dense_metrics);
        Clusterer {
            mode,
            max_cl_count,
            cl_count: 0,
            cl_it_count: 0,
            metric_count,
            iterations: DisjointSets::new(),
            store: ClusterStore::new(),
            reference: Reference::new(metric_count),
            queue: ClusterQueue::new(),
            distances_initialized: false,
            relaxations: 0,
            clustering_time: Duration::zero(),
        }
    }

    pub fn mode(&self) -> ClusterMode {
        self.mode
    }

    /// The current budget, including any relaxations.

    pub fn max_cluster_count(&self) -> u64 {
        self.max_cl_count
    }

    pub fn cluster_count(&self) -> u64 {
        self.cl_count
    }

    pub fn iteration_count(&self) -> u64 {
        self.cl_it_count
    }

    /// Number of times the budget was raised because no merge was possible.

    pub fn relaxations(&self) -> u64 {
        self.relaxations
    }

    pub fn clustering_time(&self) -> Duration {
        self.clustering_time
    }

    pub fn metric_count(&self) -> usize {
        self.metric_count
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ClusterStore {
        &mut self.store
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn iterations(&self) -> &DisjointSets {
        &self.iterations
    }

    /// The live cluster that the iteration with 0-based index `index` ended up in.

    pub fn cluster_of_iteration(&mut self, index: usize) -> ClusterId {
        self.iterations.cluster_of(index)
    }

    /// Queue a completed iteration rooted at `iteration` for clustering.

    pub fn enqueue(&self, iteration: NodeId) {
        self.queue.push(iteration);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Cluster every queued iteration, in queue order.

    pub fn process_queue(&mut self, profile: &mut Profile) {
        while let Some(iteration) = self.queue.pop() {
            self.add_iteration(profile, iteration);
        }
    }

    /// Cluster the completed iteration rooted at `root` and return the cluster created for it.
    /// The cluster may already have been merged into another one when this returns.

    pub fn add_iteration(&mut self, profile: &mut Profile, root: NodeId) -> ClusterId {
        let start = Utc::now();

        let mut cluster = Cluster::new(
            root,
            self.cl_it_count as u32 + 1,
            self.iterations.len(),
            self.metric_count,
        );
        sort_subtree(profile, root);
        cluster.hash = cluster_hash(profile, self.mode, root);
        cluster.mets_sum = iteration_metrics(profile, root);
        cluster.mets_avg = cluster.mets_sum.clone();
        let id = self.store.alloc(cluster);
        self.iterations.push(id);

        let class = self.store.insert(profile, self.mode, id);
        self.reference.update(&self.store.cluster(id).mets_avg);
        self.cl_it_count += 1;
        trace!(
            "Iteration {} has hash {:#010x}",
            self.cl_it_count,
            self.store.cluster(id).hash
        );

        if self.cl_it_count > self.max_cl_count {
            if self.distances_initialized {
                self.store
                    .distances_for_new_cluster(id, class, &self.reference);
            } else {
                self.store.compute_all_distances(&self.reference);
                self.distances_initialized = true;
            }
        }

        self.cl_count += 1;
        if self.cl_count > self.max_cl_count {
            match self
                .store
                .merge_least_distant_pair(profile, &mut self.iterations, &self.reference)
            {
                Some(_) => {
                    self.cl_count -= 1;
                }
                None => {
                    self.max_cl_count += 1;
                    self.relaxations += 1;
                    warn!(
                        "No two clusters have matching call trees, raising the cluster budget to {}",
                        self.max_cl_count
                    );
                }
            }
        }

        self.clustering_time = self.clustering_time + (Utc::now() - start);
        id
    }
}

/// The clustering session of one process.

pub struct Clustering {
    config: ClusterConfig,
    mode: Option<ClusterMode>,
    enabled: bool,
    cluster_parent: Option<NodeId>,
    clusterer: Option<Clusterer>,
}

impl Clustering {
    /// Validate `config` and start a session.  Bad settings leave clustering disabled.

    pub fn initialize(config: ClusterConfig) -> Clustering {
        let mode = config.validate();
        Clustering {
            config,
            mode,
            enabled: mode.is_some(),
            cluster_parent: None,
            clusterer: None,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The node of the dynamic region whose iterations are clustered, once it has been entered.

    pub fn cluster_parent(&self) -> Option<NodeId> {
        self.cluster_parent
    }

    pub fn clusterer(&self) -> Option<&Clusterer> {
        self.clusterer.as_ref()
    }

    pub fn clusterer_mut(&mut self) -> Option<&mut Clusterer> {
        self.clusterer.as_mut()
    }

    /// Called when the dynamic region at `node` is entered.  The first dynamic region that matches
    /// the configured name (any region if the name is empty) becomes the clustered region, unless
    /// it is entered inside a parallel region, in which case clustering is disabled.

    pub fn on_enter_dynamic(&mut self, profile: &Profile, node: NodeId, in_parallel: bool) {
        if !self.enabled || self.cluster_parent.is_some() {
            return;
        }
        let name = profile.region_of(node).map(|r| r.name.as_str()).unwrap_or("");
        if self.config.clustered_region.is_empty() || self.config.clustered_region == name {
            if in_parallel {
                warn!("Cannot cluster regions that appear inside of parallel regions. Clustering disabled.");
                self.enabled = false;
                return;
            }
            self.cluster_parent = Some(node);
        }
    }

    /// Called when the iteration rooted at `node` has completed.  Only iterations directly below
    /// the clustered region are clustered.

    pub fn on_iteration_complete(&mut self, profile: &mut Profile, node: NodeId) {
        if !self.enabled || self.cluster_parent.is_none() || profile.parent(node) != self.cluster_parent {
            return;
        }
        let Some(mode) = self.mode else {
            return;
        };
        let max = self.config.cluster_count;
        let clusterer = self
            .clusterer
            .get_or_insert_with(|| Clusterer::new(max, mode, profile.num_dense_metrics()));
        clusterer.enqueue(node);
        clusterer.process_queue(profile);
    }

    /// Stop clustering.  May be called more than once.

    pub fn finalize(&mut self) {
        self.enabled = false;
    }

    /// Number the surviving clusters 1..N and store the numbers in the cluster roots.  Does
    /// nothing if there is no clusterer or clustering was disabled.  Returns N.

    pub fn postprocess(&mut self, profile: &mut Profile) -> u32 {
        if !self.enabled {
            return 0;
        }
        match self.clusterer.as_mut() {
            Some(c) => export::postprocess(c, profile),
            None => 0,
        }
    }

    /// Collectively write the iteration-to-cluster mapping of all processes; see
    /// `export::write_mapping`.

    pub fn write_mapping(
        &mut self,
        profile: &Profile,
        collective: &dyn Collective,
        writer: &mut dyn MappingWriter,
    ) {
        export::write_mapping(self.clusterer.as_mut(), profile, collective, writer);
    }
}

#[cfg(test)]
use crate::profile::{NodeKind, Paradigm, RegionType};

#[test]
fn test_session_gating() {
    let mut p = Profile::new(0);
    let main = p.define_region("main", Paradigm::User, RegionType::Function);
    let step = p.define_region("step", Paradigm::User, RegionType::Dynamic);
    let other = p.define_region("other", Paradigm::User, RegionType::Dynamic);
    let root = p.add_root(NodeKind::ThreadRoot { thread_id: 0 });
    let m = p.add_child(root, NodeKind::RegularRegion(main));
    let o = p.add_child(m, NodeKind::RegularRegion(other));
    let s = p.add_child(m, NodeKind::RegularRegion(step));

    let config = ClusterConfig {
        clustered_region: "step".to_string(),
        ..ClusterConfig::default()
    };
    let mut session = Clustering::initialize(config);
    assert!(session.is_enabled());

    session.on_enter_dynamic(&p, o, false);
    assert!(session.cluster_parent().is_none());
    session.on_enter_dynamic(&p, s, false);
    assert!(session.cluster_parent() == Some(s));

    // Not below the clustered region
    let x = p.add_child(o, NodeKind::ParameterInteger { parameter: 0, value: 1 });
    session.on_iteration_complete(&mut p, x);
    assert!(session.clusterer().is_none());

    let it = p.add_child(s, NodeKind::ParameterInteger { parameter: 0, value: 1 });
    p.node_mut(it).count = 1;
    session.on_iteration_complete(&mut p, it);
    let c = session.clusterer().unwrap();
    assert!(c.iteration_count() == 1);
    assert!(c.cluster_count() == 1);
    assert!(c.queued() == 0);

    session.finalize();
    session.finalize();
    assert!(!session.is_enabled());
    let it = p.add_child(s, NodeKind::ParameterInteger { parameter: 0, value: 2 });
    session.on_iteration_complete(&mut p, it);
    assert!(session.clusterer().unwrap().iteration_count() == 1);
}

#[test]
fn test_parallel_enter_disables() {
    let mut p = Profile::new(0);
    let step = p.define_region("step", Paradigm::User, RegionType::Dynamic);
    let root = p.add_root(NodeKind::ThreadRoot { thread_id: 0 });
    let s = p.add_child(root, NodeKind::RegularRegion(step));

    let mut session = Clustering::initialize(ClusterConfig::default());
    session.on_enter_dynamic(&p, s, true);
    assert!(!session.is_enabled());
    assert!(session.cluster_parent().is_none());

    let session = Clustering::initialize(ClusterConfig {
        cluster_count: 0,
        ..ClusterConfig::default()
    });
    assert!(!session.is_enabled());
}
