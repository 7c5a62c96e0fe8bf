mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Run {
            policy_dir,
            audit_url,
            phase_timeout_secs,
            cache_ttl_secs,
            owner_chain_depth,
            metrics_addr,
            probe_addr,
        } => {
            commands::run::run(commands::run::RunArgs {
                policy_dir,
                audit_url,
                phase_timeout_secs,
                cache_ttl_secs,
                owner_chain_depth,
                metrics_addr,
                probe_addr,
            })
            .await?;
        }
    }

    Ok(())
}
