// Replaying profile dumps and exporting the iteration-to-cluster mapping, for one rank and for
// several ranks running as threads.

use profcluster::config::ClusterConfig;
use profcluster::export::{ATTR_CLUSTERING, ATTR_ITERATION_COUNT, ATTR_PROCESS_NUM, ATTR_ROOT_CNODE_ID};
use profcluster::{parse_dumpfile, replay, Clustering, Collective, CubeAttributes, SingleProcess, ThreadGroup};

fn config(cluster_count: u64) -> ClusterConfig {
    ClusterConfig {
        cluster_count,
        ..ClusterConfig::default()
    }
}

// Cluster one dump and run the export as `collective.rank()`.

fn export_rank(file_name: &str, config: ClusterConfig, collective: &dyn Collective) -> CubeAttributes {
    let dump = parse_dumpfile(file_name).unwrap();
    let mut session = Clustering::initialize(config);
    let mut profile = replay(&dump, &mut session).unwrap();
    session.postprocess(&mut profile);
    session.finalize();
    let mut attributes = CubeAttributes::new();
    session.write_mapping(&profile, collective, &mut attributes);
    attributes
}

fn mapping_line(attributes: &CubeAttributes, i: usize) -> Vec<u32> {
    attributes
        .get(&format!("CLUSTER MAPPING {i}"))
        .unwrap()
        .split(',')
        .map(|x| x.parse::<u32>().unwrap())
        .collect()
}

#[test]
fn test_replay_clusters_dump() {
    let dump = parse_dumpfile("testdata/rank0.json").unwrap();
    let mut session = Clustering::initialize(config(2));
    let mut profile = replay(&dump, &mut session).unwrap();

    let c = session.clusterer_mut().unwrap();
    assert!(c.iteration_count() == 6);
    assert!(c.cluster_count() == 3);
    assert!(c.relaxations() == 1);
    assert!(c.max_cluster_count() == 3);
    assert!(c.store().class_count() == 3);
    let clusters = (0..6).map(|i| c.cluster_of_iteration(i)).collect::<Vec<_>>();
    assert!(clusters[0] == clusters[1] && clusters[0] == clusters[3]);
    assert!(clusters[2] == clusters[4]);
    assert!(clusters[5] != clusters[0] && clusters[5] != clusters[2] && clusters[0] != clusters[2]);
    assert!(c.store().cluster(clusters[0]).iteration_count == 3);

    // Absorbed iterations are gone from below the dynamic region
    let dynamic = c.store().cluster(clusters[0]).root;
    let dynamic = profile.parent(dynamic).unwrap();
    assert!(profile.children(dynamic).len() == 3);
    assert!(session.postprocess(&mut profile) == 3);
}

#[test]
fn test_single_rank_mapping() {
    let attributes = export_rank("testdata/rank0.json", config(2), &SingleProcess);
    assert!(attributes.get(ATTR_CLUSTERING) == Some("ON"));
    // thread root, main, timestep
    assert!(attributes.get(ATTR_ROOT_CNODE_ID) == Some("2"));
    assert!(attributes.get(ATTR_PROCESS_NUM) == Some("1"));
    assert!(attributes.get(ATTR_ITERATION_COUNT) == Some("6"));
    assert!(attributes.get("CLUSTER MAPPING 6").is_none());

    let lines = (0..6).map(|i| mapping_line(&attributes, i)).collect::<Vec<_>>();
    for line in &lines {
        assert!(line.len() == 1);
        assert!(line[0] > 2);
    }
    assert!(lines[0] == lines[1] && lines[0] == lines[3]);
    assert!(lines[2] == lines[4]);
    assert!(lines[5] != lines[0] && lines[5] != lines[2] && lines[0] != lines[2]);
}

#[test]
fn test_clustering_off() {
    let attributes = export_rank(
        "testdata/rank0.json",
        ClusterConfig {
            enabled: false,
            ..ClusterConfig::default()
        },
        &SingleProcess,
    );
    assert!(attributes.attributes().len() == 1);
    assert!(attributes.get(ATTR_CLUSTERING) == Some("OFF"));
}

// Cluster one dump per rank, each rank on its own thread, and export over a `ThreadGroup`.  The
// results are in rank order.

fn export_group(files: &[&'static str], config: impl Fn(usize) -> ClusterConfig + Sync) -> Vec<CubeAttributes> {
    let group = ThreadGroup::new(files.len());
    let config = &config;
    std::thread::scope(|s| {
        let handles = group
            .into_iter()
            .zip(files)
            .map(|(g, f)| s.spawn(move || export_rank(f, config(g.rank()), &g)))
            .collect::<Vec<_>>();
        handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
    })
}

#[test]
fn test_thread_group_mapping() {
    let mut results = export_group(&["testdata/rank0.json", "testdata/rank1.json"], |_| config(2));

    // Only rank 0 writes
    assert!(results.pop().unwrap().attributes().is_empty());
    let attributes = results.pop().unwrap();
    assert!(attributes.get(ATTR_CLUSTERING) == Some("ON"));
    assert!(attributes.get(ATTR_PROCESS_NUM) == Some("2"));
    assert!(attributes.get(ATTR_ITERATION_COUNT) == Some("6"));

    let lines = (0..6).map(|i| mapping_line(&attributes, i)).collect::<Vec<_>>();
    for line in &lines {
        assert!(line.len() == 2);
        assert!(line[0] != 0);
    }
    // Rank 1 has four iterations, the third one an outlier
    for line in &lines[..4] {
        assert!(line[1] != 0);
    }
    assert!(lines[4][1] == 0 && lines[5][1] == 0);
    assert!(lines[0][1] == lines[1][1] && lines[0][1] == lines[3][1]);
    assert!(lines[2][1] != lines[0][1]);
}

#[test]
fn test_rank_without_clusterer() {
    let results = export_group(&["testdata/rank0.json", "testdata/rank1.json"], |rank| ClusterConfig {
        enabled: rank == 0,
        cluster_count: 2,
        ..ClusterConfig::default()
    });

    let attributes = &results[0];
    assert!(attributes.get(ATTR_CLUSTERING) == Some("ON"));
    assert!(attributes.get(ATTR_ITERATION_COUNT) == Some("6"));
    for i in 0..6 {
        let line = mapping_line(attributes, i);
        assert!(line[0] != 0 && line[1] == 0);
    }
}

#[test]
fn test_more_clusters_on_other_rank() {
    // Rank 0 ends up with two clusters, rank 1 with three
    let results = export_group(&["testdata/rank1.json", "testdata/rank0.json"], |_| config(2));
    let attributes = &results[0];
    assert!(attributes.get(ATTR_ITERATION_COUNT) == Some("6"));

    let lines = (0..6).map(|i| mapping_line(attributes, i)).collect::<Vec<_>>();
    for line in &lines {
        assert!(line[1] != 0);
    }
    assert!(lines[0][1] == lines[1][1] && lines[0][1] == lines[3][1]);
    assert!(lines[2][1] == lines[4][1]);
    assert!(lines[5][1] != lines[0][1] && lines[5][1] != lines[2][1] && lines[0][1] != lines[2][1]);

    // Equal cluster numbers share a callpath across ranks
    let mut ids = lines.iter().flatten().copied().filter(|id| *id != 0).collect::<Vec<u32>>();
    ids.sort();
    ids.dedup();
    assert!(ids.len() == 3);
}

#[test]
fn test_rank_0_without_clusterer() {
    let results = export_group(&["testdata/rank0.json", "testdata/rank1.json"], |rank| ClusterConfig {
        enabled: rank == 1,
        cluster_count: 2,
        ..ClusterConfig::default()
    });

    let attributes = &results[0];
    assert!(attributes.get(ATTR_CLUSTERING) == Some("ON"));
    assert!(attributes.get(ATTR_ROOT_CNODE_ID) == Some("0"));
    assert!(attributes.get(ATTR_ITERATION_COUNT) == Some("4"));
    let lines = (0..4).map(|i| mapping_line(attributes, i)).collect::<Vec<_>>();
    for line in &lines {
        assert!(line[0] == 0 && line[1] != 0);
    }
    assert!(lines[0][1] == lines[1][1] && lines[0][1] == lines[3][1]);
    assert!(lines[2][1] != lines[0][1]);
}
