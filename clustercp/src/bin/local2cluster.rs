use clap::Parser;
use tracing::instrument;

use clustercp::cli::{CommonArgs, PathArgs};
use clustercp::{DirectoryStrategy, Direction, Summary};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "local2cluster",
    version,
    about = "Upload a file or folder to a cluster login node",
    long_about = "`local2cluster` copies a folder (or a single file from it) from this machine to a cluster over SSH.

Without --file the local directory itself is copied into the cluster directory, so the result lands in
CLUSTER_DIR/<name of LOCAL_DIR>. Missing directories on the cluster are created. AppleDouble files (`._*`)
are skipped unless --no-default-excludes is given.

EXAMPLES:
    # Upload an input folder with progress
    local2cluster -l ~/inputs/run-7 -c /scratch/alice --host login.cluster.example --progress

    # Upload a single file into a cluster directory
    local2cluster -l ~/inputs/run-7 -c /scratch/alice/run-7 -f config.yaml --host login.cluster.example"
)]
struct Args {
    #[command(flatten)]
    paths: PathArgs,

    #[command(flatten)]
    common: CommonArgs,
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<Summary> {
    clustercp::cli::run_transfer(
        Direction::Upload,
        args.paths.request(),
        DirectoryStrategy::EntryWalk,
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
