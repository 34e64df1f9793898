mod schedule;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "minder", about = "Personal-assistant scheduler CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage scheduled jobs
    Schedule {
        #[command(subcommand)]
        command: schedule::ScheduleCommands,
    },
    /// Check system health
    Health,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Schedule { command } => schedule::run(command),
        Commands::Health => {
            let config = minder_config::load_config().unwrap_or_default();
            println!("minder is healthy");
            println!("  data dir: {}", config.data_dir.display());
            println!("  default timezone: {}", config.timezone);
            println!("  heartbeat enabled: {}", config.heartbeat.enabled);
            println!("  heartbeat chat: {}", config.heartbeat.chat_id);
            Ok(())
        }
    }
}
