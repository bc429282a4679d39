mod memory_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "recall", about = "Recall: hybrid search over agent memory")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of discovering one.
    #[arg(long, global = true, env = "RECALL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory searched for `recall.{toml,yaml,yml,json}`.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Agent workspace holding `MEMORY.md` and `memory/`.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Agent id; selects the index database and sessions directory.
    #[arg(long, global = true, default_value = "main")]
    agent: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync pass and print its report.
    Sync,
    /// Search the index.
    Search {
        query: String,
        /// Restrict results to one source (memory, sessions).
        #[arg(long, value_parser = memory_commands::parse_source)]
        source: Option<recall_memory::MemorySource>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show index, provider and sub-index status.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print lines of a memory file.
    Read {
        path: String,
        /// 1-based first line.
        #[arg(long)]
        from: Option<usize>,
        #[arg(long)]
        lines: Option<usize>,
    },
    /// Keep the index up to date until interrupted.
    Watch,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "recall starting");

    if let Some(dir) = &cli.config_dir {
        recall_config::loader::set_config_dir(dir.clone());
    }
    let settings = memory_commands::Settings {
        config: cli.config,
        workspace: cli.workspace,
        agent: cli.agent,
    };

    match cli.command {
        Commands::Sync => memory_commands::sync(&settings).await,
        Commands::Search {
            query,
            source,
            limit,
            json,
        } => memory_commands::search(&settings, &query, source, limit, json).await,
        Commands::Status { json } => memory_commands::status(&settings, json).await,
        Commands::Read { path, from, lines } => {
            memory_commands::read(&settings, &path, from, lines).await
        },
        Commands::Watch => memory_commands::watch(&settings).await,
    }
}
