use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rollout_ssh::{Config, Rollout, RolloutError, Settings, SshRemote};

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Config) -> Result<(), RolloutError> {
    let settings = Settings::resolve(cli)?;
    info!(
        "[Rollout] running {} as {} on hosts from {}",
        settings.script.display(),
        settings.user,
        settings.hosts_file.display()
    );
    let remote = Arc::new(SshRemote::new(&settings));
    let rollout = Rollout::new(settings, remote)?;
    rollout.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    setup_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[Rollout] {}", e);
            ExitCode::FAILURE
        }
    }
}
