use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowspec::cluster::{ClusterConfig, HierarchicalClustering};
use flowspec::error::FlowspecError;
use flowspec::hregex::HRegexLabeling;
use flowspec::input::parse_flows;
use flowspec::labeling::{
    ComponentLabeling, Feature, HierarchyLabeling, Ipv4PrefixLabeling, Labeling, TupleLabeling,
};

/// Infers concise intent specifications from a stream of network flows.
///
/// Reads one flow per line on stdin: whitespace-separated path labels from
/// the hierarchy file, each optionally marked `label+`, with the destination
/// address first when --ip is set.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the hierarchical labeling JSON file.
    #[arg(long, short = 'l', default_value = "labeling.json")]
    labeling: PathBuf,

    /// Number of clusters to stop at.
    #[arg(long, short = 'c', default_value_t = 1)]
    clusters: usize,

    /// Treat the first token of each flow as an IPv4 address.
    #[arg(long)]
    ip: bool,

    /// Peers sampled per scan; 0 scans everything.
    #[arg(long, short = 'b', default_value_t = 0)]
    batch: usize,

    /// PRNG seed.
    #[arg(long, short = 's', default_value_t = 10)]
    seed: u64,

    /// Use the R-tree index for neighbor lookup and subsumption.
    #[arg(long)]
    index: bool,

    /// Directory for the stats, snapshot, and hierarchy artifacts.
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), FlowspecError> {
    info!(clusters = args.clusters, batch = args.batch, seed = args.seed, "starting");

    let hierarchy = HierarchyLabeling::load(&args.labeling)?;
    let parsed = parse_flows(io::stdin().lock(), args.ip, &hierarchy)?;
    info!(flows = parsed.flows.len(), dimension = parsed.dimension, "flows read");

    let path_feature = Feature::new(
        "path",
        ComponentLabeling::Path(HRegexLabeling::new(hierarchy, parsed.dimension as f64)),
    );
    let features = if args.ip {
        vec![
            Feature::new("dst ip", ComponentLabeling::Prefix(Ipv4PrefixLabeling)),
            path_feature,
        ]
    } else {
        vec![path_feature]
    };
    let feature = Feature::new("flow", TupleLabeling::new(features));

    let mut clustering = HierarchicalClustering::new(ClusterConfig {
        cluster_count: args.clusters,
        batch_size: args.batch,
        seed: args.seed,
        ..ClusterConfig::default()
    });
    let result = if args.index {
        clustering.cluster_indexed(&parsed.flows, &feature)
    } else {
        clustering.cluster(&parsed.flows, &feature)
    };

    println!("final clusters:");
    for spec in &result {
        println!("{} cost={}", feature.labeling.render(&spec.value), spec.cost);
    }

    if let Some(dir) = &args.out {
        std::fs::create_dir_all(dir)?;
        clustering.store_stats_csv(dir)?;
        clustering.store_snapshot_json(dir)?;
        clustering.store_hierarchy_xml(dir, &feature)?;
        info!(dir = %dir.display(), "artifacts written");
    }

    Ok(())
}
