use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "nurtureflow")]
#[command(version, about = "Lead-nurturing CRM back-end for GoHighLevel")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file (defaults to ./nurtureflow.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path. Overrides the config file and NURTUREFLOW_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (CORS permissive for a local frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its tables, then exit
    InitDb,
    /// Inspect and manage GoHighLevel installations
    Installations {
        #[command(subcommand)]
        command: InstallationsCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum InstallationsCommands {
    /// List connected installations
    List,
    /// Refresh an installation's access token if it is close to expiry
    Refresh {
        id: i64,
        /// Refresh even if the token is still valid
        #[arg(long)]
        force: bool,
    },
    /// Remove an installation and everything stored for it
    Disconnect { id: i64 },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "nurtureflow=debug,tower_http=debug"
    } else {
        "nurtureflow=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = cmd::load_config(&cli)?;

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if *dev {
                config.server.dev_mode = true;
            }
            cmd::cmd_serve(config).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Installations { command } => {
            cmd::cmd_installations(&config, command.clone()).await?
        }
    }

    Ok(())
}
