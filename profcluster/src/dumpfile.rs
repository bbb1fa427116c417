// Profile dumps: the completed iterations of one rank's clustered region, as JSON.
//
// A dump is an object with these fields:
//
//   rank - integer, optional, the rank that recorded the dump
//   regions - array of region definitions { name, paradigm, type }, where paradigm is one of
//     user, compiler, mpi, openmp, other and type is one of function, loop, dynamic, barrier,
//     coll_one_to_all, coll_all_to_one, coll_all_to_all, coll_other, point_to_point, other
//   dense_metrics - array of strings, optional, names of the strictly synchronous metrics
//   callpath - array of region names, optional, the regions enclosing the dynamic region
//   dynamic_region - string, the name of the dynamic region whose iterations are recorded
//   in_parallel - boolean, optional, true if the dynamic region was entered in a parallel region
//   iterations - array of iterations { time, dense, children, threads }, in completion order
//
// Call tree nodes are objects { region, visits, time, dense, bytes_sent, bytes_received, children,
// threads }.  Only `region` is required.  The byte counters are { count, sum }.  `threads` holds,
// for every worker thread forked at the node, the list of top-level nodes that thread executed;
// the first entry is thread 1.
//
// `replay` rebuilds the profile as the measurement would have, driving a clustering session
// through the dynamic region's enter and each iteration's completion.

use crate::clusterer::Clustering;
use crate::profile::{MetricHandle, NodeId, NodeKind, Paradigm, Profile, RegionHandle, RegionType};

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path;

pub const BYTES_SENT: MetricHandle = MetricHandle(0);
pub const BYTES_RECEIVED: MetricHandle = MetricHandle(1);

#[derive(Debug, Deserialize)]
pub struct RegionDef {
    pub name: String,
    pub paradigm: Paradigm,
    #[serde(rename = "type")]
    pub region_type: RegionType,
}

#[derive(Debug, Default, Deserialize)]
pub struct ByteCount {
    pub count: u64,
    pub sum: u64,
}

#[derive(Debug, Deserialize)]
pub struct NodeDump {
    pub region: String,
    #[serde(default)]
    pub visits: u64,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub dense: Vec<u64>,
    pub bytes_sent: Option<ByteCount>,
    pub bytes_received: Option<ByteCount>,
    #[serde(default)]
    pub children: Vec<NodeDump>,
    #[serde(default)]
    pub threads: Vec<Vec<NodeDump>>,
}

#[derive(Debug, Deserialize)]
pub struct IterationDump {
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub dense: Vec<u64>,
    #[serde(default)]
    pub children: Vec<NodeDump>,
    #[serde(default)]
    pub threads: Vec<Vec<NodeDump>>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileDump {
    #[serde(default)]
    pub rank: u32,
    pub regions: Vec<RegionDef>,
    #[serde(default)]
    pub dense_metrics: Vec<String>,
    #[serde(default)]
    pub callpath: Vec<String>,
    pub dynamic_region: String,
    #[serde(default)]
    pub in_parallel: bool,
    pub iterations: Vec<IterationDump>,
}

/// Read a profile dump.  I/O errors and malformed JSON are errors.

pub fn parse_dumpfile(file_name: &str) -> Result<ProfileDump> {
    let file = File::open(path::Path::new(file_name))?;
    let reader = BufReader::new(file);
    let dump: ProfileDump = serde_json::from_reader(reader)?;
    Ok(dump)
}

// Replay state: the region lookup table and the worker thread roots, created on demand.

struct Replay<'a> {
    profile: Profile,
    regions: HashMap<&'a str, RegionHandle>,
    workers: Vec<NodeId>,
}

impl<'a> Replay<'a> {
    fn region(&self, name: &str) -> Result<RegionHandle> {
        match self.regions.get(name) {
            Some(h) => Ok(*h),
            None => bail!("Unknown region '{name}'"),
        }
    }

    fn worker_root(&mut self, thread: usize) -> NodeId {
        while self.workers.len() < thread {
            let thread_id = self.workers.len() as u64 + 1;
            let root = self.profile.add_root(NodeKind::ThreadRoot { thread_id });
            self.workers.push(root);
        }
        self.workers[thread - 1]
    }

    fn set_dense(&mut self, node: NodeId, dense: &[u64]) -> Result<()> {
        let n = self.profile.node_mut(node);
        if dense.len() > n.dense_metrics.len() {
            bail!(
                "{} dense metric values given, but only {} metrics are defined",
                dense.len(),
                n.dense_metrics.len()
            );
        }
        n.dense_metrics[..dense.len()].copy_from_slice(dense);
        Ok(())
    }

    fn add_threads(&mut self, fork: NodeId, threads: &[Vec<NodeDump>]) -> Result<()> {
        for (t, nodes) in threads.iter().enumerate() {
            let worker = self.worker_root(t + 1);
            let start = self.profile.add_thread_start(worker, fork);
            for n in nodes {
                self.add_node(start, n)?;
            }
        }
        Ok(())
    }

    fn add_node(&mut self, parent: NodeId, dump: &NodeDump) -> Result<NodeId> {
        let region = self.region(&dump.region)?;
        let node = self.profile.add_child(parent, NodeKind::RegularRegion(region));
        {
            let n = self.profile.node_mut(node);
            n.count = dump.visits;
            n.inclusive_time = dump.time;
        }
        self.set_dense(node, &dump.dense)?;
        if let Some(b) = &dump.bytes_sent {
            self.profile.add_sparse_int(node, BYTES_SENT, b.count, b.sum);
        }
        if let Some(b) = &dump.bytes_received {
            self.profile.add_sparse_int(node, BYTES_RECEIVED, b.count, b.sum);
        }
        for child in &dump.children {
            self.add_node(node, child)?;
        }
        self.add_threads(node, &dump.threads)?;
        Ok(node)
    }
}

/// Build the profile of `dump` and feed its iterations to `session` as they complete.  Returns
/// the profile, whose first root is the main thread.

pub fn replay(dump: &ProfileDump, session: &mut Clustering) -> Result<Profile> {
    let mut profile = Profile::new(dump.dense_metrics.len());
    profile.set_byte_metrics(BYTES_SENT, BYTES_RECEIVED);
    let mut regions = HashMap::new();
    for r in &dump.regions {
        if regions.contains_key(r.name.as_str()) {
            bail!("Region '{}' is defined twice", r.name);
        }
        regions.insert(r.name.as_str(), profile.define_region(&r.name, r.paradigm, r.region_type));
    }
    let main = profile.add_root(NodeKind::ThreadRoot { thread_id: 0 });
    let mut replay = Replay {
        profile,
        regions,
        workers: vec![],
    };

    let mut parent = main;
    for name in &dump.callpath {
        let region = replay.region(name)?;
        parent = replay.profile.add_child(parent, NodeKind::RegularRegion(region));
        replay.profile.node_mut(parent).count = 1;
    }
    let dynamic = replay.region(&dump.dynamic_region)?;
    let dynamic_node = replay.profile.add_child(parent, NodeKind::RegularRegion(dynamic));
    session.on_enter_dynamic(&replay.profile, dynamic_node, dump.in_parallel);

    for (k, it) in dump.iterations.iter().enumerate() {
        let node = replay.profile.add_child(
            dynamic_node,
            NodeKind::ParameterInteger {
                parameter: 0,
                value: k as i64 + 1,
            },
        );
        {
            let n = replay.profile.node_mut(node);
            n.count = 1;
            n.inclusive_time = it.time;
        }
        replay.set_dense(node, &it.dense)?;
        for child in &it.children {
            replay.add_node(node, child)?;
        }
        replay.add_threads(node, &it.threads)?;

        let d = replay.profile.node_mut(dynamic_node);
        d.count += 1;
        d.inclusive_time += it.time;

        session.on_iteration_complete(&mut replay.profile, node);
    }

    Ok(replay.profile)
}

#[test]
fn test_parse_dumpfile() {
    assert!(parse_dumpfile("testdata/no-such-dump.json").is_err());

    let dump = parse_dumpfile("testdata/rank0.json").unwrap();
    assert!(dump.rank == 0);
    assert!(dump.dynamic_region == "timestep");
    assert!(dump.iterations.len() == 6);
    assert!(dump.dense_metrics.len() == 1);
    let send = &dump.iterations[2].children[1];
    assert!(send.region == "MPI_Send");
    assert!(send.bytes_sent.as_ref().unwrap().sum == 2048);
    assert!(dump.iterations[5].children[0].threads.len() == 1);
}

#[test]
fn test_replay() {
    use crate::config::ClusterConfig;

    let dump = parse_dumpfile("testdata/rank0.json").unwrap();
    let mut session = Clustering::initialize(ClusterConfig {
        enabled: false,
        ..ClusterConfig::default()
    });
    let profile = replay(&dump, &mut session).unwrap();
    assert!(session.clusterer().is_none());

    // main thread and one worker
    assert!(profile.roots().len() == 2);
    let main = profile.children(profile.roots()[0])[0];
    assert!(profile.region_of(main).unwrap().name == "main");
    let dynamic = profile.children(main)[0];
    assert!(profile.count(dynamic) == 6);
    assert!(profile.children(dynamic).len() == 6);
    let it6 = profile.children(dynamic)[5];
    let par = profile.children(it6)[0];
    assert!(profile.is_fork_node(par));
    assert!(profile.fork_children(par).count() == 1);
}

#[test]
fn test_replay_unknown_region() {
    use crate::config::ClusterConfig;

    let dump: ProfileDump = serde_json::from_str(
        r#"{"regions": [{"name": "step", "paradigm": "user", "type": "dynamic"}],
            "dynamic_region": "step",
            "iterations": [{"time": 5, "children": [{"region": "nope"}]}]}"#,
    )
    .unwrap();
    let mut session = Clustering::initialize(ClusterConfig::default());
    assert!(replay(&dump, &mut session).is_err());
}
