use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use session_jobs::cli::{Cli, run_command};
use session_jobs::config::OrchestratorConfig;
use session_jobs::orchestrator::build_manager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = OrchestratorConfig::from_env()?;
    if let Some(backend) = cli.backend {
        config = config.with_backend(backend);
    }
    let poll_interval = config.monitor.poll_interval;

    tracing::debug!(backend = %config.backend, image = %config.image, "Building job manager");
    let manager = build_manager(config).await?;

    run_command(manager, cli.command, poll_interval).await
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("session_jobs=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
