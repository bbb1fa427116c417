// Final cluster numbering and the iteration-to-cluster mapping.
//
// After measurement the surviving clusters are numbered 1..N (`postprocess`).  The mapping is
// then written by rank 0 as a set of string attributes:
//
//   CLUSTERING                 ON or OFF
//   CLUSTER ROOT CNODE ID      callpath id of the clustered dynamic region
//   CLUSTER PROCESS NUM        number of ranks
//   CLUSTER ITERATION COUNT    largest iteration count of any rank
//   CLUSTER MAPPING <i>        for iteration i (0-based), a comma-separated list with one entry
//                              per rank: the callpath id of the cluster that the iteration was
//                              merged into, or 0 if the rank had no such iteration
//
// Every rank must call `write_mapping`, as it is a sequence of collective operations.

use crate::clusterer::Clusterer;
use crate::collective::Collective;
use crate::profile::{NodeId, Profile};

use itertools::Itertools;
use log::warn;
use std::collections::HashMap;

pub const ATTR_CLUSTERING: &str = "CLUSTERING";
pub const ATTR_ROOT_CNODE_ID: &str = "CLUSTER ROOT CNODE ID";
pub const ATTR_PROCESS_NUM: &str = "CLUSTER PROCESS NUM";
pub const ATTR_ITERATION_COUNT: &str = "CLUSTER ITERATION COUNT";
pub const ATTR_MAPPING_PREFIX: &str = "CLUSTER MAPPING";

/// The consumer of the mapping, normally the profile writer.

pub trait MappingWriter {
    fn define_attribute(&mut self, key: &str, value: &str);

    /// The id that the writer gives the callpath ending in `node`.
    fn callpath_id(&self, profile: &Profile, node: NodeId) -> u32;

    /// The callpath ids of cluster numbers 1..=`count`, indexed by cluster number - 1.  `root` is
    /// the clustered region in `profile`, if known; numbers with no cluster below it belong to
    /// clusters of other ranks and still get a distinct id.
    fn cluster_ids(&self, profile: &Profile, root: Option<NodeId>, count: usize) -> Vec<u32>;
}

/// Assign the final cluster numbers 1..N, in class order and member order within each class, and
/// store each number in the cluster's root node.  Returns N.

pub fn postprocess(clusterer: &mut Clusterer, profile: &mut Profile) -> u32 {
    let ids = clusterer
        .store()
        .classes()
        .flat_map(|c| c.members().iter().copied())
        .collect::<Vec<_>>();
    let mut counter = 0;
    for id in ids {
        counter += 1;
        let root = clusterer.store().cluster(id).root;
        profile.set_int_value(root, counter as u64);
        clusterer.store_mut().cluster_mut(id).cluster_id = counter;
    }
    counter
}

/// Write the mapping of every rank's iterations to their clusters.  `clusterer` is None on ranks
/// that never clustered anything.

pub fn write_mapping(
    mut clusterer: Option<&mut Clusterer>,
    profile: &Profile,
    collective: &dyn Collective,
    writer: &mut dyn MappingWriter,
) {
    let is_root = collective.rank() == 0;
    let has_clusterer = collective.allreduce_sum(clusterer.is_some() as u64);
    if has_clusterer == 0 {
        if is_root {
            writer.define_attribute(ATTR_CLUSTERING, "OFF");
        }
        return;
    }

    // Final cluster number of every local iteration, by iteration id - 1
    let mut it_map = vec![];
    if let Some(c) = clusterer.as_deref_mut() {
        it_map = vec![0u64; c.iteration_count() as usize];
        for index in 0..c.iterations().len() {
            let iteration_id = c.iterations().get(index).iteration_id as usize;
            let cluster = c.cluster_of_iteration(index);
            it_map[iteration_id - 1] = profile.int_value(c.store().cluster(cluster).root);
        }
    }

    // Cluster numbers are resolved against the clusters of all ranks, not only those of rank 0.
    let global_count = collective.allreduce_max(it_map.len() as u64);
    let global_clusters = collective.allreduce_max(it_map.iter().copied().max().unwrap_or(0));

    let mut cluster_ids = vec![];
    if is_root {
        writer.define_attribute(ATTR_CLUSTERING, "ON");
        let region_root = match clusterer {
            Some(c) if c.iteration_count() > 0 => {
                let first = c.cluster_of_iteration(0);
                profile.parent(c.store().cluster(first).root)
            }
            _ => None,
        };
        let root_id = match region_root {
            Some(node) => writer.callpath_id(profile, node),
            None => {
                warn!("Rank 0 has no clustered iterations, the clustered region is unknown");
                0
            }
        };
        cluster_ids = writer.cluster_ids(profile, region_root, global_clusters as usize);
        writer.define_attribute(ATTR_ROOT_CNODE_ID, &root_id.to_string());
        writer.define_attribute(ATTR_PROCESS_NUM, &collective.size().to_string());
        writer.define_attribute(ATTR_ITERATION_COUNT, &global_count.to_string());
    }

    it_map.resize(global_count as usize, 0);
    for (i, value) in it_map.iter().enumerate() {
        let line = collective.gather(*value, 0);
        collective.barrier();
        if let Some(line) = line {
            let ids = line
                .iter()
                .map(|c| cnode_of_cluster(&cluster_ids, *c))
                .join(",");
            writer.define_attribute(&format!("{ATTR_MAPPING_PREFIX} {i}"), &ids);
        }
    }
}

fn cnode_of_cluster(cluster_ids: &[u32], cluster: u64) -> u32 {
    if cluster == 0 {
        return 0;
    }
    match cluster_ids.get(cluster as usize - 1) {
        Some(id) => *id,
        None => {
            warn!("No callpath for cluster {cluster}");
            0
        }
    }
}

/// An in-memory attribute store standing in for the profile file writer.  Callpath ids are the
/// preorder positions of the nodes in the profile of rank 0.

#[derive(Default)]
pub struct CubeAttributes {
    attributes: Vec<(String, String)>,
}

impl CubeAttributes {
    pub fn new() -> CubeAttributes {
        CubeAttributes::default()
    }

    /// All attributes, in definition order.

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl MappingWriter for CubeAttributes {
    fn define_attribute(&mut self, key: &str, value: &str) {
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.attributes.push((key.to_string(), value.to_string())),
        }
    }

    fn callpath_id(&self, profile: &Profile, node: NodeId) -> u32 {
        profile
            .preorder()
            .iter()
            .position(|n| *n == node)
            .map(|p| p as u32)
            .unwrap_or(0)
    }

    fn cluster_ids(&self, profile: &Profile, root: Option<NodeId>, count: usize) -> Vec<u32> {
        let preorder = profile.preorder();
        let positions = preorder
            .iter()
            .enumerate()
            .map(|(p, n)| (*n, p as u32))
            .collect::<HashMap<NodeId, u32>>();
        let mut ids = vec![0; count];
        if let Some(root) = root {
            for child in profile.children(root) {
                let number = profile.int_value(*child) as usize;
                if number == 0 || number > count {
                    warn!("Unexpected cluster number {number} below the clustered region");
                    continue;
                }
                ids[number - 1] = positions.get(child).copied().unwrap_or(0);
            }
        }

        // Clusters that rank 0 does not have are numbered after the end of its tree
        let mut next = preorder.len() as u32;
        for id in ids.iter_mut().filter(|id| **id == 0) {
            *id = next;
            next += 1;
        }
        ids
    }
}
