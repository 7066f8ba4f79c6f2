use clap::{Parser, Subcommand};
use tracing::Level;

mod commands;

use commands::{extract, gen, install, pack};

#[derive(Parser)]
#[command(
    name = "kachina",
    about = "Self-addressable installer and updater",
    version,
    long_about = "Builds single-file installer packages (pack/gen/extract) and runs \
                  installs and updates from them, offline or over HTTP range requests."
)]
struct Cli {
    /// Set the logging level
    #[arg(short, long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a package executable from a config and a staging dir
    Pack(pack::PackArgs),

    /// Hash a release tree, generate patches and emit the manifest
    Gen(gen::GenArgs),

    /// Inspect or unpack an existing package
    Extract(extract::ExtractArgs),

    /// Install or update from this package or a remote source
    Install(install::InstallArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::from(cli.log_level))
        .with_target(false)
        .init();

    let code = match cli.command {
        Commands::Pack(args) => exit_code_from(pack::handle(args)),
        Commands::Gen(args) => exit_code_from(gen::handle(args).await),
        Commands::Extract(args) => exit_code_from(extract::handle(args)),
        Commands::Install(args) => install::handle(args).await,
    };
    std::process::exit(code);
}

fn exit_code_from(result: anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}
