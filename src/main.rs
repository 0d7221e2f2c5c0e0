use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use simplemem::auth::TenantContext;
use simplemem::config::SimpleMemConfig;
use simplemem::engine::Engine;
use simplemem::server;

#[derive(Parser)]
#[command(name = "simplemem", version, about = "Multi-tenant long-term memory service for LLM agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP/MCP server
    Serve,
    /// Run one consolidation pass (decay, merge, prune) for a tenant
    Consolidate {
        /// Tenant user id
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SimpleMemConfig::load()?;

    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            server::serve(config).await?;
        }
        Command::Consolidate { user } => {
            let engine = Engine::new(config)?;
            let ctx = TenantContext { user_id: user };
            let report = engine
                .consolidate(&ctx)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
