// `clusterlyze` -- Cluster the iterations of a dynamic region in profile dumps
//
// Each dump file holds the iterations that one rank recorded for its clustered region (see
// profcluster/src/dumpfile.rs for the format).  The `cluster` command replays every dump through a
// clustering session of its own, one thread per rank, and then exports the iteration-to-cluster
// mapping collectively across those threads, as the ranks of a measurement would.  The `tree`
// command prints the canonical iteration trees of a dump with their structural hashes, which is
// what decides whether two iterations can be clustered together.
//
// Built with the `mpi` feature, `cluster --mpi` runs under mpirun instead: each process replays the
// dump at its own rank and the export runs across the processes.  Only rank 0 prints.
//
// Settings come from the command line, then the --config-file, then the SCOREP_PROFILING_*
// environment variables, then the defaults, in that order of precedence.

mod clusters;
mod format;
mod tree;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use log::warn;
use profcluster::dumpfile::ProfileDump;
use profcluster::{
    parse_dumpfile, replay, ClusterConfig, ClusterMode, Clustering, CubeAttributes, Profile, ThreadGroup,
};
use std::io;
use std::process;
use std::thread;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cluster the iterations of one dump per rank, print the clusters and the mapping
    Cluster(ClusterArgs),

    /// Print the sorted iteration trees of a dump with their structural hashes
    Tree(TreeArgs),
}

#[derive(Args, Debug)]
pub struct ClusterArgs {
    #[command(flatten)]
    config_args: ConfigArgs,

    #[command(flatten)]
    print_args: PrintArgs,

    #[command(flatten)]
    meta_args: MetaArgs,

    /// Run as one process of an MPI job, clustering the dump at this process's rank
    #[cfg(feature = "mpi")]
    #[arg(long, default_value_t = false)]
    mpi: bool,

    /// Dump file names, one per rank, rank 0 first
    #[arg(last = true)]
    dumpfiles: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TreeArgs {
    #[command(flatten)]
    config_args: ConfigArgs,

    #[command(flatten)]
    meta_args: MetaArgs,

    /// Dump file name
    dumpfile: String,
}

#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// File containing JSON data with clustering settings [default: none]
    #[arg(long)]
    config_file: Option<String>,

    /// Maximum number of clusters [default: 64]
    #[arg(long, short = 'n')]
    cluster_count: Option<u64>,

    /// Call tree matching mode, 0 (none) to 5 (all visits in communication subtrees) [default: 1]
    #[arg(long, short)]
    mode: Option<u64>,

    /// Name of the dynamic region to cluster [default: the first one entered]
    #[arg(long, short)]
    region: Option<String>,

    /// Turn clustering off
    #[arg(long, default_value_t = false)]
    no_clustering: bool,
}

#[derive(Args, Debug, Default)]
pub struct PrintArgs {
    /// Select fields for the cluster table, from rank, cluster, hash, count, iterations, time,
    /// visits, mpi-time, bytes [default: all]
    #[arg(long)]
    fmt: Option<String>,

    /// Print the cluster table as CSV
    #[arg(long, default_value_t = false)]
    csv: bool,

    /// Do not print a header line
    #[arg(long, default_value_t = false)]
    no_header: bool,

    /// Do not print the mapping attributes
    #[arg(long, default_value_t = false)]
    no_mapping: bool,
}

#[derive(Args, Debug, Default)]
pub struct MetaArgs {
    /// Print statistics about the clustering to stderr, and log every merge
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

fn main() {
    match clusterlyze() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn clusterlyze() -> Result<()> {
    let cli = Cli::parse();

    let meta_args = match cli.command {
        Commands::Cluster(ref cluster_args) => &cluster_args.meta_args,
        Commands::Tree(ref tree_args) => &tree_args.meta_args,
    };
    let level = if meta_args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Cluster(ref cluster_args) => {
            let config = cluster_config(&cluster_args.config_args)?;
            #[cfg(feature = "mpi")]
            if cluster_args.mpi {
                return cluster_dump_mpi(&mut io::stdout(), config, cluster_args);
            }
            cluster_dumps(&mut io::stdout(), config, cluster_args)
        }
        Commands::Tree(ref tree_args) => {
            let config = cluster_config(&tree_args.config_args)?;
            print_tree(&mut io::stdout(), &config, tree_args)
        }
    }
}

fn cluster_config(args: &ConfigArgs) -> Result<ClusterConfig> {
    let mut config = ClusterConfig::from_env()?;
    if let Some(ref config_filename) = args.config_file {
        config.merge_json_file(config_filename)?;
    }
    if let Some(n) = args.cluster_count {
        config.cluster_count = n;
    }
    if let Some(m) = args.mode {
        config.mode = m;
    }
    if let Some(ref r) = args.region {
        config.clustered_region = r.clone();
    }
    if args.no_clustering {
        config.enabled = false;
    }
    Ok(config)
}

// One rank's profile and its finished clustering session.

struct RankRun {
    profile: Profile,
    session: Clustering,
}

fn cluster_rank(dump: &ProfileDump, config: ClusterConfig) -> Result<RankRun> {
    let mut session = Clustering::initialize(config);
    let mut profile = replay(dump, &mut session)?;
    session.postprocess(&mut profile);
    session.finalize();
    Ok(RankRun { profile, session })
}

fn cluster_dumps(output: &mut dyn io::Write, config: ClusterConfig, args: &ClusterArgs) -> Result<()> {
    if args.dumpfiles.is_empty() {
        bail!("No dump files");
    }
    let dumps = args
        .dumpfiles
        .iter()
        .map(|f| parse_dumpfile(f))
        .collect::<Result<Vec<ProfileDump>>>()?;
    for (rank, dump) in dumps.iter().enumerate() {
        if dump.rank as usize != rank {
            warn!("Dump number {rank} was recorded by rank {}", dump.rank);
        }
    }

    // All ranks must have replayed successfully before any of them enters the export, or the
    // others would wait for it forever.
    let mut ranks = thread::scope(|s| {
        let handles = dumps
            .iter()
            .map(|dump| {
                let config = config.clone();
                s.spawn(move || cluster_rank(dump, config))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("Clustering thread panicked"))?)
            .collect::<Result<Vec<RankRun>>>()
    })?;

    let group = ThreadGroup::new(ranks.len());
    let mut exported = thread::scope(|s| {
        let handles = ranks
            .iter_mut()
            .zip(group)
            .map(|(r, g)| {
                s.spawn(move || {
                    let mut attributes = CubeAttributes::new();
                    r.session.write_mapping(&r.profile, &g, &mut attributes);
                    attributes
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("Export thread panicked")))
            .collect::<Result<Vec<CubeAttributes>>>()
    })?;
    let attributes = exported.swap_remove(0);

    let mut rows = vec![];
    for (rank, r) in ranks.iter_mut().enumerate() {
        rows.extend(rank_rows(rank, r, args.meta_args.verbose));
    }
    print_results(output, &rows, &attributes, args)
}

#[cfg(feature = "mpi")]
fn cluster_dump_mpi(output: &mut dyn io::Write, config: ClusterConfig, args: &ClusterArgs) -> Result<()> {
    use profcluster::{Collective, MpiWorld};

    let world = MpiWorld::initialize()?;
    let rank = world.rank();
    if args.dumpfiles.len() != world.size() {
        bail!("{} dump files for {} MPI processes", args.dumpfiles.len(), world.size());
    }
    let dump = parse_dumpfile(&args.dumpfiles[rank])?;
    if dump.rank as usize != rank {
        warn!("Dump number {rank} was recorded by rank {}", dump.rank);
    }
    let mut run = cluster_rank(&dump, config)?;
    let mut attributes = CubeAttributes::new();
    run.session.write_mapping(&run.profile, &world, &mut attributes);
    let rows = rank_rows(rank, &mut run, args.meta_args.verbose);
    if rank == 0 {
        print_results(output, &rows, &attributes, args)?;
    }
    Ok(())
}

// The cluster table rows of one rank, with statistics to stderr if `verbose`.

fn rank_rows(rank: usize, r: &mut RankRun, verbose: bool) -> Vec<clusters::ClusterRow> {
    let Some(c) = r.session.clusterer_mut() else {
        if verbose {
            eprintln!("Rank {rank}: no clustering");
        }
        return vec![];
    };
    if verbose {
        eprintln!(
            "Rank {rank}: {} iterations, {} clusters in {} classes, budget {} ({} relaxations), {} distance edges",
            c.iteration_count(),
            c.cluster_count(),
            c.store().class_count(),
            c.max_cluster_count(),
            c.relaxations(),
            c.store().edges().live()
        );
        eprintln!(
            "Rank {rank}: clustering time {}us",
            c.clustering_time().num_microseconds().unwrap_or_default()
        );
    }
    clusters::cluster_rows(rank, c)
}

fn print_results(
    output: &mut dyn io::Write,
    rows: &[clusters::ClusterRow],
    attributes: &CubeAttributes,
    args: &ClusterArgs,
) -> Result<()> {
    if !rows.is_empty() {
        clusters::print_clusters(output, rows, &args.print_args)?;
    }
    if !args.print_args.no_mapping {
        if !rows.is_empty() {
            writeln!(output)?;
        }
        for (key, value) in attributes.attributes() {
            writeln!(output, "{key}: {value}")?;
        }
    }
    Ok(())
}

fn print_tree(output: &mut dyn io::Write, config: &ClusterConfig, args: &TreeArgs) -> Result<()> {
    let Some(mode) = ClusterMode::from_u64(config.mode) else {
        bail!("Invalid clustering mode {}", config.mode);
    };
    let dump = parse_dumpfile(&args.dumpfile)?;
    let mut session = Clustering::initialize(ClusterConfig {
        enabled: false,
        ..ClusterConfig::default()
    });
    let mut profile = replay(&dump, &mut session)?;
    let region = if config.clustered_region.is_empty() {
        &dump.dynamic_region
    } else {
        &config.clustered_region
    };
    let roots = tree::iteration_roots(&profile, region)?;
    if args.meta_args.verbose {
        eprintln!("{} iterations of {region}", roots.len());
    }
    tree::print_trees(output, &mut profile, mode, &roots)
}

#[test]
fn test_command_line() {
    let cli = Cli::try_parse_from(["clusterlyze", "cluster", "-n", "3", "--csv", "--", "a.json", "b.json"]).unwrap();
    let Commands::Cluster(args) = cli.command else {
        panic!("Not a cluster command");
    };
    assert!(args.config_args.cluster_count == Some(3));
    assert!(args.print_args.csv);
    assert!(args.dumpfiles == vec!["a.json", "b.json"]);

    assert!(Cli::try_parse_from(["clusterlyze", "tree"]).is_err());
    assert!(Cli::try_parse_from(["clusterlyze", "tree", "--mode", "x", "a.json"]).is_err());
}

#[test]
fn test_cluster_config() {
    let config = cluster_config(&ConfigArgs {
        config_file: Some("../profcluster/testdata/config.json".to_string()),
        cluster_count: Some(7),
        ..ConfigArgs::default()
    })
    .unwrap();
    // The switch wins over the file, the file over the default
    assert!(config.cluster_count == 7);
    assert!(config.mode == 2);
    assert!(config.clustered_region == "timestep");

    assert!(cluster_config(&ConfigArgs {
        config_file: Some("../profcluster/testdata/bad_config.json".to_string()),
        ..ConfigArgs::default()
    })
    .is_err());
}

#[test]
fn test_cluster_dumps() {
    let args = ClusterArgs {
        config_args: ConfigArgs::default(),
        print_args: PrintArgs {
            fmt: Some("rank,cluster,count".to_string()),
            csv: true,
            ..PrintArgs::default()
        },
        meta_args: MetaArgs::default(),
        #[cfg(feature = "mpi")]
        mpi: false,
        dumpfiles: vec![
            "../profcluster/testdata/rank0.json".to_string(),
            "../profcluster/testdata/rank1.json".to_string(),
        ],
    };
    let config = ClusterConfig {
        cluster_count: 2,
        ..ClusterConfig::default()
    };
    let mut out = vec![];
    cluster_dumps(&mut out, config, &args).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines[0] == "rank,cluster,count");
    // Three clusters on rank 0, two on rank 1
    assert!(lines[1..6].iter().filter(|l| l.starts_with("0,")).count() == 3);
    assert!(lines[1..6].iter().filter(|l| l.starts_with("1,")).count() == 2);
    assert!(lines[6].is_empty());
    assert!(lines.contains(&"CLUSTERING: ON"));
    assert!(lines.contains(&"CLUSTER PROCESS NUM: 2"));
    assert!(lines.contains(&"CLUSTER ITERATION COUNT: 6"));
    assert!(lines.iter().any(|l| l.starts_with("CLUSTER MAPPING 5: ") && l.ends_with(",0")));
}
