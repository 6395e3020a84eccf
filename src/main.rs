//! filehub command-line entry point

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use filehub::config::Config;
use filehub::context::RequestContext;
use filehub::driver::FileInfo;
use filehub::hub::FileHub;

#[derive(Parser, Debug)]
#[command(name = "filehub", version, about = "Access storage sources through filehub")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "filehub.yaml")]
    config: PathBuf,

    /// User to act as
    #[arg(short, long)]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured storage sources
    Sources,
    /// List a directory
    Ls {
        source: String,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show metadata for a path
    Stat { source: String, path: String },
    /// Write a file to stdout
    Cat { source: String, path: String },
    /// Upload a local file
    Put {
        source: String,
        path: String,
        local: PathBuf,
    },
    /// Create a directory
    Mkdir { source: String, path: String },
    /// Remove a file or directory tree
    Rm { source: String, path: String },
    /// Rename or move within a source
    Mv {
        source: String,
        from: String,
        to: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!("Loaded configuration from {:?}", cli.config);

    let hub = FileHub::from_config(&config);
    let ctx = match hub.login(&cli.user).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Cannot act as '{}': {}", cli.user, e);
            std::process::exit(1);
        }
    };

    // Ctrl-C cancels the in-flight operation
    let token = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            token.cancel();
        }
    });

    let outcome = run(&hub, &ctx, cli.command).await;

    if let Err(e) = hub.shutdown().await {
        warn!("Error during shutdown: {}", e);
    }

    if let Err(e) = outcome {
        eprintln!("filehub: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(hub: &FileHub, ctx: &RequestContext, command: Command) -> filehub::Result<()> {
    match command {
        Command::Sources => {
            for source in hub.sources().await? {
                println!("{:<16} {:<6} {}", source.key, source.driver, source.name);
            }
        }
        Command::Ls { source, path } => {
            let driver = hub.driver(ctx, &source).await?;
            for entry in driver.list(ctx, &path).await? {
                print_entry(&entry);
            }
        }
        Command::Stat { source, path } => {
            let driver = hub.driver(ctx, &source).await?;
            print_entry(&driver.stat(ctx, &path).await?);
        }
        Command::Cat { source, path } => {
            let driver = hub.driver(ctx, &source).await?;
            let mut reader = driver.open(ctx, &path).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
        }
        Command::Put {
            source,
            path,
            local,
        } => {
            let driver = hub.driver(ctx, &source).await?;
            let mut file = tokio::fs::File::open(&local).await?;
            let size = file.metadata().await?.len();
            let written = driver.create(ctx, &path, &mut file, Some(size)).await?;
            info!("Uploaded {:?} to {}:{} ({} bytes)", local, source, path, written);
        }
        Command::Mkdir { source, path } => {
            hub.driver(ctx, &source).await?.mkdir(ctx, &path).await?;
        }
        Command::Rm { source, path } => {
            hub.driver(ctx, &source).await?.delete(ctx, &path).await?;
        }
        Command::Mv { source, from, to } => {
            hub.driver(ctx, &source).await?.rename(ctx, &from, &to).await?;
        }
    }
    Ok(())
}

fn print_entry(entry: &FileInfo) {
    let modified = chrono::DateTime::<chrono::Utc>::from(entry.modified);
    let kind = if entry.is_dir { 'd' } else { '-' };
    println!(
        "{} {:>12} {} {}",
        kind,
        entry.size,
        modified.format("%Y-%m-%d %H:%M"),
        entry.name
    );
}
