use clap::Parser;
use tracing::instrument;

use clustercp::cli::{CommonArgs, PathArgs};
use clustercp::{DirectoryStrategy, Direction, Summary};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cluster2local",
    version,
    about = "Download a file or folder from a cluster login node",
    long_about = "`cluster2local` copies a folder (or a single file from it) from a cluster to this machine over SSH.

Without --file the cluster directory itself is copied into the local directory, so the result lands in
LOCAL_DIR/<name of CLUSTER_DIR>. AppleDouble files (`._*`) are skipped unless --no-default-excludes is given.

EXAMPLES:
    # Download a results folder with progress
    cluster2local -l ~/results -c /scratch/alice/run-7 --host login.cluster.example --progress

    # Download a single file
    cluster2local -l ~/results -c /scratch/alice/run-7 -f summary.csv --host login.cluster.example

    # Many small files: let the cluster pack them into one archive first
    cluster2local -l ~/results -c /scratch/alice/run-7 --archive --summary"
)]
struct Args {
    #[command(flatten)]
    paths: PathArgs,

    // Transfer options
    /// Pack the folder into a single compressed archive on the cluster before downloading it
    ///
    /// Faster for folders holding many small files. Needs `tar` and `mktemp` on the cluster; the
    /// temporary archives are removed afterwards.
    #[arg(long, help_heading = "Transfer options")]
    archive: bool,

    #[command(flatten)]
    common: CommonArgs,
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<Summary> {
    let strategy = if args.archive {
        DirectoryStrategy::Archive
    } else {
        DirectoryStrategy::EntryWalk
    };
    clustercp::cli::run_transfer(
        Direction::Download,
        args.paths.request(),
        strategy,
        args.common,
    )
    .await
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let res = common::run(args.common.output(), args.common.runtime(), func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
