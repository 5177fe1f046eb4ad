use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "pausegate-cli", version, about = "Pausegate CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Monitored-app allowlist management
    Apps {
        #[command(subcommand)]
        action: commands::apps::AppsAction,
    },
    /// Quick-task quota inspection
    Quota {
        #[command(subcommand)]
        action: commands::quota::QuotaAction,
    },
    /// Durable engine state inspection
    State {
        #[command(subcommand)]
        action: commands::state::StateAction,
    },
    /// Replay a JSONL event stream through an offline engine
    Replay(commands::replay::ReplayArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Config { action } => commands::config::run(action),
        Commands::Apps { action } => commands::apps::run(action),
        Commands::Quota { action } => commands::quota::run(action),
        Commands::State { action } => commands::state::run(action),
        Commands::Replay(args) => commands::replay::run(args),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
