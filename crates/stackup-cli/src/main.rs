mod cmd;
mod output;
mod root;
mod signal;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use stackup_core::pipeline::Stage;
use stackup_core::StackupError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "stackup",
    about = "Provision a local Kubernetes cluster and bring the application stack up to a verified healthy state",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: nearest directory with stackup.yaml, else cwd)
    #[arg(long, global = true, env = "STACKUP_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Debug logging
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full provisioning pipeline
    Up {
        /// Resume at this stage (preflight, credentials and runtime-access always run)
        #[arg(long, value_parser = parse_stage)]
        from_stage: Option<Stage>,

        /// Stop after the readiness waits
        #[arg(long)]
        skip_health: bool,

        #[arg(long, hide = true, env = "STACKUP_REEXEC_DEPTH", default_value = "0")]
        reexec_depth: u32,
    },

    /// Check the application's health endpoint through a port-forward
    Verify,

    /// Show cluster host, node, and application pod status
    Status,

    /// List required tools and whether they are installed
    Tools,

    /// Print how to reach the deployed application
    Access,

    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn parse_stage(raw: &str) -> Result<Stage, String> {
    raw.parse().map_err(|e: StackupError| e.to_string())
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        match &cli.command {
            Commands::Up { .. } | Commands::Verify => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        }
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
        Commands::Up {
            from_stage,
            skip_health,
            reexec_depth,
        } => cmd::up::run(
            &root,
            cmd::up::UpArgs {
                from_stage,
                skip_health,
                reexec_depth,
            },
            cli.json,
        ),
        Commands::Verify => cmd::verify::run(&root, cli.json),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::Tools => cmd::tools::run(&root, cli.json),
        Commands::Access => cmd::access::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        if e.downcast_ref::<cmd::Interrupted>().is_some() {
            eprintln!("interrupted");
            std::process::exit(130);
        }
        eprintln!("error: {e:#}");
        if let Some(hint) = e.downcast_ref::<StackupError>().and_then(StackupError::hint) {
            eprintln!("hint: {hint}");
        }
        std::process::exit(1);
    }
}
