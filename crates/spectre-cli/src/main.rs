//! Spectre CLI entry point.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use spectre::Spectre;
use spectre_cli::commands::{self, AnalyzeArgs, Output, ResourcesAction};
use spectre_cli::config::load_config;

#[derive(Parser)]
#[command(
    name = "spectre",
    about = "Spectre: capture JSON API traffic, discover resources, query what was seen",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Path to the capture database (overrides the configuration).
    #[arg(short, long, global = true)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and load declared resources.
    Init,

    /// Ingest capture events (JSON Lines) from a file or stdin.
    Ingest {
        /// Events file; stdin when omitted.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Session id for events that carry none.
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Cluster captured URLs into resource candidates.
    Analyze(AnalyzeArgs),

    /// Inspect and manage resources.
    Resources {
        #[command(subcommand)]
        action: ResourcesAction,
    },

    /// Print a stored body by digest.
    Blob {
        /// SHA-256 hex digest.
        digest: String,
    },

    /// Delete old captures and the blobs only they referenced.
    Clean {
        /// Delete captures older than this many days.
        #[arg(long, default_value_t = 30)]
        older_than_days: u32,

        /// Also delete every unreferenced blob.
        #[arg(long)]
        sweep: bool,
    },

    /// Show database statistics.
    Info,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   spectre completions bash > ~/.local/share/bash-completion/completions/spectre
    ///   spectre completions zsh > ~/.zfunc/_spectre
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "spectre", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref(), cli.database.as_deref())?;
    let spectre = Spectre::open(config)?;
    let out = Output { json: cli.json };

    match &cli.command {
        Commands::Init => commands::init(&spectre, out)?,
        Commands::Ingest { file, session } => {
            commands::ingest(&spectre, file.as_deref(), session.clone(), out)?
        }
        Commands::Analyze(args) => commands::analyze(&spectre, args, out)?,
        Commands::Resources { action } => commands::resources(&spectre, action, out)?,
        Commands::Blob { digest } => commands::blob(&spectre, digest)?,
        Commands::Clean {
            older_than_days,
            sweep,
        } => commands::clean(&spectre, *older_than_days, *sweep, out)?,
        Commands::Info => commands::info(&spectre, out)?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
