use std::process::ExitCode;

use clap::Parser;
use execflux::config::Cli;
use execflux::error::RunError;
use execflux::orchestrator::Orchestrator;
use execflux::sampler::SysinfoProbe;
use utils::logging;
use utils::version;

/// Exit code for invalid configuration.
const EXIT_CONFIG: u8 = 2;
/// Exit code for an unexpected failure while supervising the command.
const EXIT_RUN_FAILURE: u8 = 70;
/// Exit code when the command could not be started.
const EXIT_START_FAILURE: u8 = 127;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_global_hooks();

    let cli = Cli::parse();
    logging::init(logging::level_for_verbosity(cli.verbose));

    tracing::debug!("execflux {}", &**version::VERSION);

    ExitCode::from(run(cli).await)
}

async fn run(cli: Cli) -> u8 {
    let plan = match cli.into_plan() {
        Ok(plan) => plan,
        Err(e) => {
            tracing::error!("invalid configuration: {e:?}");
            return EXIT_CONFIG;
        }
    };

    match Orchestrator::new(plan, SysinfoProbe::new()).run().await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => match e.current_context() {
            RunError::Spawn { .. } => {
                tracing::error!("error starting command: {e:?}");
                EXIT_START_FAILURE
            }
            _ => {
                tracing::error!("error running command: {e:?}");
                EXIT_RUN_FAILURE
            }
        },
    }
}
