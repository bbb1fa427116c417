// Structural comparison of iteration call trees.
//
// Before an iteration is hashed or compared its subtree is brought into canonical order with
// `sort_subtree`.  The structural hash is a cheap filter; two trees with equal hashes are then
// compared node by node with `call_trees_match`.  Both follow the strictness policy of
// `ClusterMode`, and both descend into threads forked inside the tree.
//
// The hash also computes the `mpi_in_subtree` flag of every node it visits, and the comparison
// depends on that flag in the communication-only modes, so a tree must be hashed before it is
// compared.

use crate::config::ClusterMode;
use crate::profile::{NodeId, NodeKind, Profile};

use log::trace;

const VISIT_EXEMPT_PREFIXES: [&str; 3] = ["MPI_Probe", "MPI_Iprobe", "MPI_Test"];

/// True if the visit count of `node` must match for two trees to be equal under `mode`.  Polling
/// MPI calls are exempt, as their visit counts vary from run to run.

pub fn considers_visits(profile: &Profile, mode: ClusterMode, node: NodeId) -> bool {
    if !mode.visits_matter(profile.is_mpi_node(node)) {
        return false;
    }
    if let NodeKind::RegularRegion(handle) = profile.node(node).kind {
        let name = &profile.region(handle).name;
        if VISIT_EXEMPT_PREFIXES.iter().any(|p| name.starts_with(p)) {
            return false;
        }
    }
    true
}

/// Sort the children of every node in the subtree of `node`, including the subtrees of the threads
/// forked in it, by the canonical node order.

pub fn sort_subtree(profile: &mut Profile, node: NodeId) {
    let mut children = std::mem::take(&mut profile.node_mut(node).children);
    children.sort_by(|a, b| profile.node_order(*a, *b));
    profile.node_mut(node).children = children;

    for child in profile.children_with_forks(node).collect::<Vec<NodeId>>() {
        sort_subtree(profile, child);
    }
}

/// Hash the shape of the subtree of `node` and set `mpi_in_subtree` on every node in it.

pub fn structural_hash(profile: &mut Profile, mode: ClusterMode, node: NodeId) -> u32 {
    if mode == ClusterMode::Off {
        return profile.node_hash(node);
    }
    let is_mpi = profile.is_mpi_node(node);
    profile.set_mpi_in_subtree(node, is_mpi);

    let mut val: u32 = 0;
    let mut used: u32 = 0;
    for child in profile.children(node).to_vec() {
        let child_val = structural_hash(profile, mode, child);
        let child_mpi = profile.mpi_in_subtree(child);
        if mode.communication_only() && !child_mpi {
            continue;
        }
        if child_mpi {
            profile.set_mpi_in_subtree(node, true);
        }
        used += 1;
        val = val.wrapping_add(used).rotate_right(1).wrapping_add(child_val);
    }

    // Threads are numbered from 2; the thread-start node itself is not part of the shape.
    let mut thread_count: u32 = 1;
    for start in profile.fork_children(node).collect::<Vec<NodeId>>() {
        thread_count += 1;
        let child_val = structural_hash(profile, mode, start).wrapping_sub(profile.node_hash(start));
        let child_mpi = profile.mpi_in_subtree(start);
        if mode.communication_only() && !child_mpi {
            continue;
        }
        if child_mpi {
            profile.set_mpi_in_subtree(node, true);
        }
        val = val
            .wrapping_add(thread_count + 1)
            .rotate_right(1)
            .wrapping_add(child_val);
    }

    if considers_visits(profile, mode, node) {
        val = val.wrapping_add(profile.count(node) as u32).rotate_right(1);
    }

    val.wrapping_add(profile.node_hash(node))
}

/// The hash of an iteration tree rooted at `root`.  The root itself differs between iterations and
/// is left out, so in mode 0 every iteration hashes to 0.

pub fn cluster_hash(profile: &mut Profile, mode: ClusterMode, root: NodeId) -> u32 {
    structural_hash(profile, mode, root).wrapping_sub(profile.node_hash(root))
}

// The children that take part in comparison.

fn relevant_children(profile: &Profile, mode: ClusterMode, node: NodeId) -> Vec<NodeId> {
    profile
        .children(node)
        .iter()
        .copied()
        .filter(|c| !mode.communication_only() || profile.mpi_in_subtree(*c))
        .collect()
}

/// True if the trees below `a` and `b` are equal under `mode`.  The roots themselves are not
/// compared.  Visit counts, where they matter, are compared per iteration: `a_count` and `b_count`
/// are the number of iterations merged into each tree.

pub fn call_trees_match(
    profile: &Profile,
    mode: ClusterMode,
    a: NodeId,
    b: NodeId,
    a_count: u32,
    b_count: u32,
) -> bool {
    if mode == ClusterMode::Off {
        return true;
    }

    let a_children = relevant_children(profile, mode, a);
    let b_children = relevant_children(profile, mode, b);
    if a_children.len() != b_children.len() {
        trace!("Call trees differ in the number of children of {:?} and {:?}", a, b);
        return false;
    }
    for (x, y) in a_children.iter().zip(b_children.iter()) {
        if !profile.same_node(*x, *y) {
            trace!("Call trees differ at {:?} and {:?}", x, y);
            return false;
        }
        if considers_visits(profile, mode, *x)
            && profile.count(*x) / a_count as u64 != profile.count(*y) / b_count as u64
        {
            trace!("Visit counts differ at {:?} and {:?}", x, y);
            return false;
        }
        if !call_trees_match(profile, mode, *x, *y, a_count, b_count) {
            return false;
        }
    }

    let a_fork = profile.is_fork_node(a);
    let b_fork = profile.is_fork_node(b);
    if a_fork != b_fork {
        trace!("Fork nodes differ at {:?} and {:?}", a, b);
        return false;
    }
    if a_fork {
        for root in profile.roots() {
            let start_a = profile.thread_start_for_fork(*root, a);
            let start_b = profile.thread_start_for_fork(*root, b);
            match (start_a, start_b) {
                (None, None) => continue,
                (Some(x), Some(y)) => {
                    if mode.communication_only()
                        && !profile.mpi_in_subtree(x)
                        && !profile.mpi_in_subtree(y)
                    {
                        continue;
                    }
                    if !call_trees_match(profile, mode, x, y, a_count, b_count) {
                        return false;
                    }
                }
                _ => {
                    trace!("Forked threads differ at {:?} and {:?}", a, b);
                    return false;
                }
            }
        }
    }

    true
}

#[cfg(test)]
use crate::profile::{Paradigm, RegionType};

// Two iterations below one thread root: iteration 1 calls compute and MPI_Probe (2 visits),
// iteration 2 calls MPI_Probe (5 visits) and compute, in that order.

#[cfg(test)]
fn two_iterations() -> (Profile, NodeId, NodeId) {
    let mut p = Profile::new(0);
    let compute = p.define_region("compute", Paradigm::User, RegionType::Function);
    let probe = p.define_region("MPI_Probe", Paradigm::Mpi, RegionType::PointToPoint);
    let root = p.add_root(NodeKind::ThreadRoot { thread_id: 0 });

    let it1 = p.add_child(root, NodeKind::ParameterInteger { parameter: 0, value: 1 });
    let c = p.add_child(it1, NodeKind::RegularRegion(compute));
    p.node_mut(c).count = 1;
    let q = p.add_child(it1, NodeKind::RegularRegion(probe));
    p.node_mut(q).count = 2;

    let it2 = p.add_child(root, NodeKind::ParameterInteger { parameter: 0, value: 2 });
    let q = p.add_child(it2, NodeKind::RegularRegion(probe));
    p.node_mut(q).count = 5;
    let c = p.add_child(it2, NodeKind::RegularRegion(compute));
    p.node_mut(c).count = 1;

    (p, it1, it2)
}

#[test]
fn test_sort_and_hash() {
    let (mut p, it1, it2) = two_iterations();
    sort_subtree(&mut p, it1);
    sort_subtree(&mut p, it2);
    let first = |p: &Profile, n: NodeId| p.children(n)[0];
    assert!(p.same_node(first(&p, it1), first(&p, it2)));

    let h1 = cluster_hash(&mut p, ClusterMode::Structure, it1);
    let h2 = cluster_hash(&mut p, ClusterMode::Structure, it2);
    assert!(h1 == h2);
    assert!(p.mpi_in_subtree(it1));
    assert!(!p.mpi_in_subtree(first(&p, it1)));

    assert!(cluster_hash(&mut p, ClusterMode::Off, it1) == 0);
}

#[test]
fn test_probe_visits_exempt() {
    let (mut p, it1, it2) = two_iterations();
    sort_subtree(&mut p, it1);
    sort_subtree(&mut p, it2);
    let mode = ClusterMode::StructureVisits;
    let h1 = cluster_hash(&mut p, mode, it1);
    let h2 = cluster_hash(&mut p, mode, it2);
    assert!(h1 == h2);
    assert!(call_trees_match(&p, mode, it1, it2, 1, 1));

    // The same trees with MPI_Send instead of MPI_Probe do not match
    let send = p.define_region("MPI_Send", Paradigm::Mpi, RegionType::PointToPoint);
    for it in [it1, it2] {
        let q = p.children(it)[1];
        p.node_mut(q).kind = NodeKind::RegularRegion(send);
    }
    assert!(!call_trees_match(&p, mode, it1, it2, 1, 1));
    assert!(call_trees_match(&p, ClusterMode::Structure, it1, it2, 1, 1));
    // Normalized by iteration count: 2/1 == 5/2 and 1/1 == 2/2
    let c = p.children(it2)[0];
    p.node_mut(c).count = 2;
    assert!(call_trees_match(&p, mode, it1, it2, 1, 2));
}

#[test]
fn test_communication_only() {
    let (mut p, it1, it2) = two_iterations();
    let extra = p.define_region("extra", Paradigm::User, RegionType::Function);
    p.add_child(it2, NodeKind::RegularRegion(extra));
    sort_subtree(&mut p, it1);
    sort_subtree(&mut p, it2);

    let mode = ClusterMode::Communication;
    let h1 = cluster_hash(&mut p, mode, it1);
    let h2 = cluster_hash(&mut p, mode, it2);
    assert!(h1 == h2);
    assert!(call_trees_match(&p, mode, it1, it2, 1, 1));

    let mode = ClusterMode::Structure;
    let h1 = cluster_hash(&mut p, mode, it1);
    let h2 = cluster_hash(&mut p, mode, it2);
    assert!(h1 != h2);
    assert!(!call_trees_match(&p, mode, it1, it2, 1, 1));
}

#[test]
fn test_forked_threads() {
    let (mut p, it1, it2) = two_iterations();
    let work = p.define_region("work", Paradigm::Openmp, RegionType::Function);
    let worker = p.add_root(NodeKind::ThreadRoot { thread_id: 1 });
    let fork1 = p.children(it1)[0];
    let fork2 = p.children(it2)[1];
    let s1 = p.add_thread_start(worker, fork1);
    p.add_child(s1, NodeKind::RegularRegion(work));
    let s2 = p.add_thread_start(worker, fork2);
    p.add_child(s2, NodeKind::RegularRegion(work));

    sort_subtree(&mut p, it1);
    sort_subtree(&mut p, it2);
    let mode = ClusterMode::Structure;
    let h1 = cluster_hash(&mut p, mode, it1);
    let h2 = cluster_hash(&mut p, mode, it2);
    assert!(h1 == h2);
    assert!(call_trees_match(&p, mode, it1, it2, 1, 1));

    // A second worker region on one side only
    p.add_child(s2, NodeKind::RegularRegion(work));
    assert!(!call_trees_match(&p, mode, it1, it2, 1, 1));
    let h2 = cluster_hash(&mut p, mode, it2);
    assert!(h1 != h2);
}
