// Cluster table: one row per surviving cluster of every rank.

use crate::format;
use crate::PrintArgs;

use anyhow::Result;
use profcluster::metrics::Metric;
use profcluster::store::ClusterId;
use profcluster::Clusterer;
use std::collections::HashMap;
use std::io;

#[derive(Debug)]
pub struct ClusterRow {
    pub rank: usize,
    pub cluster: u32,
    pub hash: u32,
    pub iterations: Vec<u32>,
    pub time: f64,
    pub visits: f64,
    pub mpi_time: f64,
    pub bytes: f64,
}

/// The rows for the clusters of `clusterer`, in final numbering order.  The clusterer must have
/// been postprocessed.

pub fn cluster_rows(rank: usize, clusterer: &mut Clusterer) -> Vec<ClusterRow> {
    let mut members = HashMap::<ClusterId, Vec<u32>>::new();
    for index in 0..clusterer.iterations().len() {
        let iteration_id = clusterer.iterations().get(index).iteration_id;
        let cluster = clusterer.cluster_of_iteration(index);
        members.entry(cluster).or_default().push(iteration_id);
    }

    let store = clusterer.store();
    let mut rows = vec![];
    for class in store.classes() {
        for id in class.members() {
            let c = store.cluster(*id);
            rows.push(ClusterRow {
                rank,
                cluster: c.cluster_id,
                hash: c.hash,
                iterations: members.remove(id).unwrap_or_default(),
                time: c.mets_avg[Metric::ExecutionTime],
                visits: c.mets_avg[Metric::Visits],
                mpi_time: c.mets_avg[Metric::MpiTime],
                bytes: c.mets_avg[Metric::Bytes],
            });
        }
    }
    rows
}

pub fn print_clusters(output: &mut dyn io::Write, rows: &[ClusterRow], print_args: &PrintArgs) -> Result<()> {
    let mut formatters: HashMap<String, &dyn Fn(&ClusterRow, bool) -> String> = HashMap::new();
    formatters.insert("rank".to_string(), &format_rank);
    formatters.insert("cluster".to_string(), &format_cluster);
    formatters.insert("hash".to_string(), &format_hash);
    formatters.insert("count".to_string(), &format_count);
    formatters.insert("iterations".to_string(), &format_iterations);
    formatters.insert("time".to_string(), &format_time);
    formatters.insert("visits".to_string(), &format_visits);
    formatters.insert("mpi-time".to_string(), &format_mpi_time);
    formatters.insert("bytes".to_string(), &format_bytes);

    let spec = if let Some(ref fmt) = print_args.fmt {
        fmt.as_str()
    } else {
        "rank,cluster,hash,count,iterations,time,visits,mpi-time,bytes"
    };
    let fields = format::parse_fields(spec, &formatters)?;
    format::format_data(
        output,
        &fields,
        &formatters,
        !print_args.no_header,
        print_args.csv,
        rows,
        false,
    )
}

fn format_rank(r: &ClusterRow, _: bool) -> String {
    r.rank.to_string()
}

fn format_cluster(r: &ClusterRow, _: bool) -> String {
    r.cluster.to_string()
}

fn format_hash(r: &ClusterRow, _: bool) -> String {
    format!("{:08x}", r.hash)
}

fn format_count(r: &ClusterRow, _: bool) -> String {
    r.iterations.len().to_string()
}

// Runs of consecutive iterations are collapsed, 1-3,5

fn format_iterations(r: &ClusterRow, _: bool) -> String {
    let mut runs: Vec<(u32, u32)> = vec![];
    for i in &r.iterations {
        match runs.last_mut() {
            Some((_, last)) if *last + 1 == *i => *last = *i,
            _ => runs.push((*i, *i)),
        }
    }
    runs.iter()
        .map(|(first, last)| {
            if first == last {
                first.to_string()
            } else {
                format!("{first}-{last}")
            }
        })
        .collect::<Vec<String>>()
        .join(",")
}

fn format_time(r: &ClusterRow, _: bool) -> String {
    format!("{:.1}", r.time)
}

fn format_visits(r: &ClusterRow, _: bool) -> String {
    format!("{:.1}", r.visits)
}

fn format_mpi_time(r: &ClusterRow, _: bool) -> String {
    format!("{:.1}", r.mpi_time)
}

fn format_bytes(r: &ClusterRow, _: bool) -> String {
    format!("{:.0}", r.bytes)
}

#[test]
fn test_cluster_rows() {
    use profcluster::{parse_dumpfile, replay, ClusterConfig, Clustering};

    let dump = parse_dumpfile("../profcluster/testdata/rank0.json").unwrap();
    let mut session = Clustering::initialize(ClusterConfig {
        cluster_count: 2,
        ..ClusterConfig::default()
    });
    let mut profile = replay(&dump, &mut session).unwrap();
    assert!(session.postprocess(&mut profile) == 3);

    let rows = cluster_rows(0, session.clusterer_mut().unwrap());
    assert!(rows.len() == 3);
    assert!(rows.iter().map(|r| r.cluster).collect::<Vec<u32>>() == vec![1, 2, 3]);
    let mut iterations = rows.iter().map(|r| format_iterations(r, false)).collect::<Vec<String>>();
    iterations.sort();
    assert!(iterations == vec!["1-2,4", "3,5", "6"]);
    for r in &rows {
        assert!(r.time > 0.0);
    }
}
