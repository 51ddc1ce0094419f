use clap::{Args, Parser, Subcommand};
use cluster_futures::{
    builtin::{self, ShellTask},
    config::ExecutorConfig,
    executor::ClusterExecutor,
    logging::init_logging,
    map::{map, MapOptions},
    remote::{worker_main, WorkerArgs},
};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info, warn};
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run shell commands as cluster jobs")]
struct Cli {
    /// Log at debug level unless CFUT_LOG says otherwise
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the task of a single worker id, started by the cluster scheduler
    Worker(WorkerArgs),
    /// Submit every command line as a job and print the output of each
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Executor configuration (YAML)
    #[arg(long)]
    config: PathBuf,
    /// Print results as soon as they are ready instead of in the given order
    #[arg(long)]
    unordered: bool,
    /// Give up on a job after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Command lines, each one becomes a job
    #[arg(last = true, required = true)]
    commands: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Worker(args) => {
            init_logging(cli.debug);

            let registry = builtin::registry().unwrap_or_log();
            worker_main(&registry, args).unwrap_or_log();

            ExitCode::SUCCESS
        }
        Command::Run(args) => run(cli.debug, args),
    }
}

fn run(debug: bool, args: RunArgs) -> ExitCode {
    let config = ExecutorConfig::load(&args.config);
    init_logging(debug || config.as_ref().map_or(false, |config| config.debug));

    let executor = ClusterExecutor::new(config.unwrap_or_log()).unwrap_or_log();
    let options = MapOptions {
        ordered: !args.unordered,
        timeout: args.timeout.map(Duration::from_secs),
    };
    info!(jobs = args.commands.len(), "Submitting commands");

    let results = map(
        &executor,
        args.commands.into_iter().map(ShellTask::new),
        options,
    )
    .unwrap_or_log();

    let mut success = true;
    for result in results {
        match result {
            Ok(output) => {
                print!("{}", output.stdout);

                if output.code != 0 {
                    warn!(code = output.code, stderr = %output.stderr, "Command failed");
                    success = false;
                }
            }
            Err(error) => {
                error!(error = %error, "Job failed");
                success = false;
            }
        }
    }

    // remaining jobs were already submitted, wait for them so their files are cleaned up
    executor.shutdown(true).unwrap_or_log();

    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
