mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    anchor::AnchorSubcommand, config::ConfigSubcommand, keys::KeysSubcommand,
    work::WorkSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "veriq",
    about = "Verifiable job platform: intents, leases, signed receipts and daily anchors",
    version,
    propagate_version = true
)]
struct Cli {
    /// Data root (default: auto-detect from .veriq/)
    #[arg(long, global = true, env = "VERIQ_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .veriq/ with a default config and a signing key
    Init,

    /// Run the HTTP server with its sweeper, sealer and built-in worker
    Serve {
        /// Port to listen on (0 = OS-assigned)
        #[arg(long, default_value = "7300")]
        port: u16,
    },

    /// Queue depth, active key and current anchor day
    Status,

    /// Canonicalize JSON and optionally print its CID
    Canon {
        /// Input file (default: stdin)
        file: Option<PathBuf>,
        /// Drop object members whose value is null
        #[arg(long)]
        null_strip: bool,
        /// Write integral floats as integers
        #[arg(long)]
        num_norm: bool,
        /// Print the CID instead of the canonical bytes
        #[arg(long)]
        cid: bool,
    },

    /// Submit and inspect work
    Work {
        #[command(subcommand)]
        subcommand: WorkSubcommand,
    },

    /// Drain ready work with the built-in worker
    Drain {
        /// Stop after this many receipts
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Requeue or abandon expired leases
    Sweep,

    /// Print a stored receipt
    Receipt { cid: String },

    /// Verify a receipt by CID or from a JSON document
    Verify {
        /// Receipt CID in the local ledger
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        cid: Option<String>,
        /// Receipt JSON document
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Inspect, seal and rebuild daily anchors
    Anchor {
        #[command(subcommand)]
        subcommand: AnchorSubcommand,
    },

    /// Manage signing keys
    Keys {
        #[command(subcommand)]
        subcommand: KeysSubcommand,
    },

    /// Show, initialize or validate veriq.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Serve { port } => cmd::serve::run(&root, port),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::Canon {
            file,
            null_strip,
            num_norm,
            cid,
        } => cmd::canon::run(file.as_deref(), null_strip, num_norm, cid, cli.json),
        Commands::Work { subcommand } => cmd::work::run(&root, subcommand, cli.json),
        Commands::Drain { limit } => cmd::work::drain(&root, limit, cli.json),
        Commands::Sweep => cmd::work::sweep(&root, cli.json),
        Commands::Receipt { cid } => cmd::verify::show(&root, &cid, cli.json),
        Commands::Verify { cid, file } => {
            cmd::verify::run(&root, cid.as_deref(), file.as_deref(), cli.json)
        }
        Commands::Anchor { subcommand } => cmd::anchor::run(&root, subcommand, cli.json),
        Commands::Keys { subcommand } => cmd::keys::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
