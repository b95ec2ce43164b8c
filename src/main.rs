//! # Multipass CLI (`mpass`)
//!
//! ## Usage
//!
//! ```bash
//! mpass --config ./config/multipass.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mpass sources` | List sources, whether they are configured, and whether their credentials are set |
//! | `mpass check` | Read with admin credentials, filter for the configured user, report what was withheld |
//! | `mpass filter` | Print the metadata filter a vector store should apply for the user |
//! | `mpass oauth <name>` | Acquire a user token through the PKCE flow |
//!
//! Logs go to stderr and follow `RUST_LOG` (default `info`); reports go to
//! stdout.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use multipass::{check, config, oauth, sources};
use multipass_core::DataSource;
use tracing_subscriber::EnvFilter;

/// Multipass: per-user authorization for documents ingested from
/// third-party sources.
#[derive(Parser)]
#[command(
    name = "mpass",
    about = "Multipass: per-user authorization filtering for ingested documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/multipass.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List sources and their configuration status.
    Sources,

    /// Ingest, enrich and filter; print authorized and withheld counts.
    Check {
        /// Only this source (`github`, `gitlab`, `slack`, `dropbox`,
        /// `onedrive`, `confluence`, `jira`, `gdrive`).
        #[arg(long)]
        source: Option<DataSource>,

        /// Documents per page; defaults to `filter.page_size`.
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Print the OR-combined access filter as JSON.
    Filter {
        #[arg(long)]
        source: Option<DataSource>,
    },

    /// Run the OAuth PKCE flow for a configured `[oauth.<name>]` provider.
    Oauth {
        /// Provider name.
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Check { source, page_size } => {
            check::run_check(&cfg, source, page_size).await?;
        }
        Commands::Filter { source } => {
            check::run_filter(&cfg, source).await?;
        }
        Commands::Oauth { name } => {
            oauth::run_oauth(&cfg, &name).await?;
        }
    }

    Ok(())
}
