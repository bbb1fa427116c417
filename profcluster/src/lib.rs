// This library clusters the iterations of a dynamic region of a call-path profile while the profile
// is being recorded.  Iterations whose call trees match are merged when the number of clusters
// exceeds a budget, closest metrics first, so that a long-running loop leaves a bounded number of
// representative iteration subtrees in the profile.  At the end a mapping from every iteration of
// every rank to its cluster is exported.
//
// The profile itself, and a JSON dump format that can be replayed into it, are included so that
// the engine can be driven outside of a measurement system.

pub mod clusterer;
pub mod collective;
pub mod compare;
pub mod config;
pub mod disjoint;
pub mod distance;
pub mod dumpfile;
pub mod export;
pub mod metrics;
pub mod profile;
pub mod queue;
pub mod store;

// Per-process clustering session and the clustering engine proper.

pub use clusterer::{Clusterer, Clustering};

pub use config::{ClusterConfig, ClusterMode};

// Collective transports for exporting the mapping.

pub use collective::{Collective, SingleProcess, ThreadGroup};

#[cfg(feature = "mpi")]
pub use collective::MpiWorld;

pub use export::{CubeAttributes, MappingWriter};

pub use profile::{NodeId, Profile};

// Read a profile dump and replay it through a clustering session.

pub use dumpfile::{parse_dumpfile, replay};
