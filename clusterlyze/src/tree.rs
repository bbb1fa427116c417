// Print the iterations of a dump as canonical (sorted) call trees, with the structural hash of every
// subtree.  Two iterations can only be clustered together if their iteration hashes are equal.

use anyhow::{bail, Result};
use profcluster::compare::{cluster_hash, sort_subtree, structural_hash};
use profcluster::config::ClusterMode;
use profcluster::profile::{NodeId, NodeKind, Profile};
use std::io;

/// The iteration nodes of the clustered region `region`, in completion order.

pub fn iteration_roots(profile: &Profile, region: &str) -> Result<Vec<NodeId>> {
    let Some(dynamic) = profile
        .preorder()
        .into_iter()
        .find(|n| profile.region_of(*n).map(|r| r.name == region).unwrap_or(false))
    else {
        bail!("No node for region '{region}'");
    };
    Ok(profile.children(dynamic).to_vec())
}

pub fn print_trees(output: &mut dyn io::Write, profile: &mut Profile, mode: ClusterMode, roots: &[NodeId]) -> Result<()> {
    for root in roots {
        sort_subtree(profile, *root);
        let hash = cluster_hash(profile, mode, *root);
        writeln!(output, "{} hash={:08x}", label(profile, *root), hash)?;
        for child in profile.children_with_forks(*root).collect::<Vec<NodeId>>() {
            print_node(output, profile, mode, child, 1)?;
        }
    }
    Ok(())
}

fn print_node(output: &mut dyn io::Write, profile: &mut Profile, mode: ClusterMode, node: NodeId, depth: usize) -> Result<()> {
    let hash = structural_hash(profile, mode, node);
    let n = profile.node(node);
    writeln!(
        output,
        "{:indent$}{} visits={} time={} hash={:08x}{}",
        "",
        label(profile, node),
        n.count,
        n.inclusive_time,
        hash,
        if profile.mpi_in_subtree(node) { " mpi" } else { "" },
        indent = depth * 2
    )?;
    for child in profile.children_with_forks(node).collect::<Vec<NodeId>>() {
        print_node(output, profile, mode, child, depth + 1)?;
    }
    Ok(())
}

fn label(profile: &Profile, node: NodeId) -> String {
    match &profile.node(node).kind {
        NodeKind::RegularRegion(_) => match profile.region_of(node) {
            Some(r) => r.name.clone(),
            None => "?".to_string(),
        },
        NodeKind::ParameterString { value, .. } => format!("parameter {value}"),
        NodeKind::ParameterInteger { value, .. } => format!("iteration {value}"),
        NodeKind::ThreadRoot { thread_id } => format!("thread {thread_id}"),
        NodeKind::ThreadStart { .. } => "thread start".to_string(),
        NodeKind::Collapse { depth } => format!("collapse {depth}"),
    }
}

#[test]
fn test_print_trees() {
    use profcluster::{parse_dumpfile, replay, ClusterConfig, Clustering};

    let dump = parse_dumpfile("../profcluster/testdata/rank0.json").unwrap();
    let mut session = Clustering::initialize(ClusterConfig {
        enabled: false,
        ..ClusterConfig::default()
    });
    let mut profile = replay(&dump, &mut session).unwrap();
    let roots = iteration_roots(&profile, &dump.dynamic_region).unwrap();
    assert!(roots.len() == 6);
    assert!(iteration_roots(&profile, "nope").is_err());

    let mut out = vec![];
    print_trees(&mut out, &mut profile, ClusterMode::Structure, &roots).unwrap();
    let text = String::from_utf8(out).unwrap();
    let iterations = text
        .lines()
        .filter(|l| l.starts_with("iteration"))
        .map(|l| l.split_once(" hash=").unwrap().1)
        .collect::<Vec<&str>>();
    assert!(iterations.len() == 6);
    // Children are sorted, so the reversed second iteration hashes like the first
    assert!(iterations[0] == iterations[1] && iterations[0] == iterations[3]);
    assert!(iterations[0] != iterations[2]);
    assert!(text.contains("    thread start"));
}
