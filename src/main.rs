use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "rootcause")]
#[command(version, about = "Alert-driven root cause analysis, streamed over WebSocket")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to rootcause.toml (defaults to ./rootcause.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the alert intake and streaming server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,

        /// Replay canned investigations instead of querying backends
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective configuration
    Config,
    /// Run one alert through the pipeline and print each message as JSON
    Analyze {
        /// Alertmanager webhook document (JSON)
        #[arg(long)]
        alert: PathBuf,

        /// Replay canned investigations instead of querying backends
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    rootcause::logging::init(cli.verbose, cli.log_json)?;

    match &cli.command {
        Commands::Serve {
            host,
            port,
            dev,
            dry_run,
        } => {
            cmd::cmd_serve(
                cli.config.as_deref(),
                cmd::ServeOverrides {
                    host: host.clone(),
                    port: *port,
                    dev: *dev,
                },
                *dry_run,
            )
            .await?;
        }
        Commands::Config => cmd::cmd_config(cli.config.as_deref())?,
        Commands::Analyze { alert, dry_run } => {
            cmd::cmd_analyze(cli.config.as_deref(), alert, *dry_run).await?;
        }
    }

    Ok(())
}
