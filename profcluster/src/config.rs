// Clustering configuration.
//
// The measurement system reads four settings from the environment:
//
//   SCOREP_PROFILING_ENABLE_CLUSTERING   true/false, default true
//   SCOREP_PROFILING_CLUSTER_COUNT       maximum number of clusters, default 64
//   SCOREP_PROFILING_CLUSTERING_MODE     structural matching strictness 0..5, default 1
//   SCOREP_PROFILING_CLUSTERED_REGION    name of the dynamic region to cluster, default "" which
//                                        means the first dynamic region that is entered
//
// The same settings can be given in a JSON config file, an object with these optional fields:
//
//   enabled - boolean
//   cluster_count - integer
//   clustering_mode - integer
//   clustered_region - string
//
// An invalid budget or mode is not an error: it disables clustering with a warning, see
// `ClusterConfig::validate`.

use anyhow::{bail, Result};
use log::warn;
use serde_json::Value;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path;
use std::str::FromStr;

pub const ENV_ENABLE: &str = "SCOREP_PROFILING_ENABLE_CLUSTERING";
pub const ENV_CLUSTER_COUNT: &str = "SCOREP_PROFILING_CLUSTER_COUNT";
pub const ENV_MODE: &str = "SCOREP_PROFILING_CLUSTERING_MODE";
pub const ENV_REGION: &str = "SCOREP_PROFILING_CLUSTERED_REGION";

/// How strictly two iteration call trees must match to be merged.
///
///  Mode  Structure compared               Visit counts compared
///  0     nothing, all trees are equal     never
///  1     full tree                        never
///  2     full tree                        always
///  3     subtrees containing MPI only     never
///  4     subtrees containing MPI only     for MPI nodes
///  5     subtrees containing MPI only     always
///
/// MPI_Probe, MPI_Iprobe and MPI_Test nodes never have their visit counts compared.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClusterMode {
    Off = 0,
    Structure = 1,
    StructureVisits = 2,
    Communication = 3,
    CommunicationMpiVisits = 4,
    CommunicationVisits = 5,
}

impl ClusterMode {
    pub fn from_u64(mode: u64) -> Option<ClusterMode> {
        match mode {
            0 => Some(ClusterMode::Off),
            1 => Some(ClusterMode::Structure),
            2 => Some(ClusterMode::StructureVisits),
            3 => Some(ClusterMode::Communication),
            4 => Some(ClusterMode::CommunicationMpiVisits),
            5 => Some(ClusterMode::CommunicationVisits),
            _ => None,
        }
    }

    /// True if only subtrees that contain MPI calls take part in hashing and comparison.

    pub fn communication_only(self) -> bool {
        self >= ClusterMode::Communication
    }

    /// True if the visit count of a node with the given MPI classification must match.

    pub fn visits_matter(self, is_mpi: bool) -> bool {
        match self {
            ClusterMode::StructureVisits | ClusterMode::CommunicationVisits => true,
            ClusterMode::CommunicationMpiVisits => is_mpi,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub cluster_count: u64,
    pub mode: u64,
    pub clustered_region: String,
}

impl Default for ClusterConfig {
    fn default() -> ClusterConfig {
        ClusterConfig {
            enabled: true,
            cluster_count: 64,
            mode: 1,
            clustered_region: "".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Defaults overridden by whatever is set in the process environment.

    pub fn from_env() -> Result<ClusterConfig> {
        ClusterConfig::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overridden by the variables that `lookup` knows about.  Values that do not parse
    /// are errors.

    pub fn from_lookup<F>(lookup: F) -> Result<ClusterConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ClusterConfig::default();
        if let Some(v) = lookup(ENV_ENABLE) {
            config.enabled = parse_bool(&v)?;
        }
        if let Some(v) = lookup(ENV_CLUSTER_COUNT) {
            config.cluster_count = parse_u64(ENV_CLUSTER_COUNT, &v)?;
        }
        if let Some(v) = lookup(ENV_MODE) {
            config.mode = parse_u64(ENV_MODE, &v)?;
        }
        if let Some(v) = lookup(ENV_REGION) {
            config.clustered_region = v.trim().to_string();
        }
        Ok(config)
    }

    /// Override settings with the fields present in the JSON config file `filename`.

    // The file is human-written and every field is optional, so it is decoded explicitly from the
    // generic JSON value rather than with a derived parser.

    pub fn merge_json_file(&mut self, filename: &str) -> Result<()> {
        let file = File::open(path::Path::new(filename))?;
        let reader = BufReader::new(file);
        let v: Value = serde_json::from_reader(reader)?;
        let Value::Object(fields) = v else {
            bail!("Expected an object value in {filename}")
        };
        if let Some(v) = fields.get("enabled") {
            if let Value::Bool(b) = v {
                self.enabled = *b;
            } else {
                bail!("Field 'enabled' must have a boolean value");
            }
        }
        if let Some(n) = grab_u64(&fields, "cluster_count")? {
            self.cluster_count = n;
        }
        if let Some(n) = grab_u64(&fields, "clustering_mode")? {
            self.mode = n;
        }
        if let Some(v) = fields.get("clustered_region") {
            if let Value::String(s) = v {
                self.clustered_region = s.clone();
            } else {
                bail!("Field 'clustered_region' must have a string value");
            }
        }
        Ok(())
    }

    /// Check the settings once at initialization.  Returns the mode to cluster with, or None if
    /// clustering is off, either because it was not requested or because the settings are bad.

    pub fn validate(&self) -> Option<ClusterMode> {
        if !self.enabled {
            return None;
        }
        if self.cluster_count < 1 {
            warn!(
                "Max number of clusters is zero. Clustering disabled. \
                 Set {ENV_CLUSTER_COUNT} to a value greater than 0 to enable clustering"
            );
            return None;
        }
        match ClusterMode::from_u64(self.mode) {
            Some(mode) => Some(mode),
            None => {
                warn!(
                    "Unknown clustering mode {} set in {ENV_MODE}. Possible mode values are 0 to 5.",
                    self.mode
                );
                warn!("Disable clustering.");
                None
            }
        }
    }
}

fn grab_u64(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<u64>> {
    match fields.get(name) {
        None => Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(n) => Ok(Some(n)),
            None => bail!("Field '{name}' must be a nonnegative integer"),
        },
        Some(_) => bail!("Field '{name}' must have a numeric value"),
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => bail!("Invalid boolean value '{s}' for {ENV_ENABLE}"),
    }
}

fn parse_u64(name: &str, s: &str) -> Result<u64> {
    match u64::from_str(s.trim()) {
        Ok(n) => Ok(n),
        Err(_) => bail!("Invalid value '{s}' for {name}, expected a nonnegative integer"),
    }
}

#[test]
fn test_from_lookup() {
    let c = ClusterConfig::from_lookup(|_| None).unwrap();
    assert!(c == ClusterConfig::default());

    let c = ClusterConfig::from_lookup(|name| match name {
        ENV_CLUSTER_COUNT => Some("8".to_string()),
        ENV_MODE => Some(" 4 ".to_string()),
        ENV_REGION => Some("timestep".to_string()),
        ENV_ENABLE => Some("yes".to_string()),
        _ => None,
    })
    .unwrap();
    assert!(c.enabled);
    assert!(c.cluster_count == 8);
    assert!(c.mode == 4);
    assert!(c.clustered_region == "timestep");

    assert!(ClusterConfig::from_lookup(|name| {
        if name == ENV_CLUSTER_COUNT { Some("many".to_string()) } else { None }
    })
    .is_err());
    assert!(ClusterConfig::from_lookup(|name| {
        if name == ENV_ENABLE { Some("maybe".to_string()) } else { None }
    })
    .is_err());
}

#[test]
fn test_merge_json_file() {
    let mut c = ClusterConfig::default();
    c.merge_json_file("testdata/config.json").unwrap();
    assert!(c.cluster_count == 4);
    assert!(c.mode == 2);
    assert!(c.clustered_region == "timestep");
    assert!(c.enabled);

    let mut c = ClusterConfig::default();
    assert!(c.merge_json_file("testdata/no-such-config.json").is_err());
    assert!(c.merge_json_file("testdata/bad_config.json").is_err());
}

#[test]
fn test_validate() {
    let mut c = ClusterConfig::default();
    assert!(c.validate() == Some(ClusterMode::Structure));
    c.mode = 6;
    assert!(c.validate().is_none());
    c.mode = 0;
    assert!(c.validate() == Some(ClusterMode::Off));
    c.cluster_count = 0;
    assert!(c.validate().is_none());
    c.cluster_count = 3;
    c.enabled = false;
    assert!(c.validate().is_none());
}

#[test]
fn test_mode_policy() {
    assert!(!ClusterMode::Structure.communication_only());
    assert!(ClusterMode::Communication.communication_only());
    assert!(ClusterMode::StructureVisits.visits_matter(false));
    assert!(ClusterMode::CommunicationMpiVisits.visits_matter(true));
    assert!(!ClusterMode::CommunicationMpiVisits.visits_matter(false));
    assert!(!ClusterMode::Communication.visits_matter(true));
    assert!(!ClusterMode::Off.visits_matter(true));
}
