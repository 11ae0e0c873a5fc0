//! Workhive daemon process.
//!
//! Spawned by the daemon pool. Reads commands from stdin and writes
//! responses to stdout; logs go to stderr.

use clap::Parser;

#[derive(Parser)]
#[command(name = "workhive-worker")]
#[command(about = "Daemon process for isolated Workhive work items")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the built-in action names and exit
    #[arg(long)]
    list_actions: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    // Stdout is the protocol channel.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let registry = workhive_worker::builtin_registry();

    if cli.list_actions {
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    tracing::debug!(pid = std::process::id(), "workhive-worker starting");
    workhive_core::serve_stdio(&registry)?;
    tracing::debug!(pid = std::process::id(), "workhive-worker exiting");
    Ok(())
}
