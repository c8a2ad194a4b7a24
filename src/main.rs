use clap::Parser;
use oracle_sentinel::cli::{commands, Cli, Commands, OutputMode};
use oracle_sentinel::logging::{init_logging, init_logging_simple};
use oracle_sentinel::SentinelEngine;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    match &cli.command {
        Commands::Run => {
            init_logging(&config.logging);
            let engine = match SentinelEngine::build(&config).await {
                Ok(engine) => engine,
                Err(e) => {
                    error!("Failed to start engine: {}", e);
                    return Err(e.into());
                }
            };
            engine.run_until_signal().await?;
        }
        Commands::Status { json } => {
            init_logging_simple();
            commands::show_status(&config, OutputMode::from_json_flag(*json)).await?;
        }
        Commands::Recover { branch, operator } => {
            init_logging_simple();
            commands::recover(&config, branch, operator).await?;
        }
        Commands::Halt { branch, reason } => {
            init_logging_simple();
            commands::halt(&config, branch, reason).await?;
        }
        Commands::Trip { branch, reason } => {
            init_logging_simple();
            commands::trip(&config, branch, reason).await?;
        }
        Commands::CheckConfig { json } => {
            init_logging_simple();
            commands::check_config(&config, OutputMode::from_json_flag(*json))?;
        }
    }

    Ok(())
}
