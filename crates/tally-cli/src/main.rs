//! Tally CLI
//!
//! Command-line interface for Tally - drink check-ins with an operation log.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tally_core::{Config, DrinkStyle, Identity, SiteId, Store};

mod commands;
mod output;

use commands::checkin::DrinkArgs;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Tally - drink check-ins, ready to merge across devices")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create this device's site identity
    Init {
        /// Reuse a known site ID (when restoring a device)
        #[arg(long)]
        site: Option<String>,
    },
    /// Check in a drink
    #[command(alias = "checkin")]
    Add {
        /// Drink name
        #[arg(short, long)]
        name: Option<String>,
        /// Drink style (beer, wine, sake, cider, mead, spirit, cocktail)
        #[arg(short, long)]
        style: Option<DrinkStyle>,
        /// Alcohol by volume, percent
        #[arg(long)]
        abv: Option<f64>,
        /// Price paid
        #[arg(short, long)]
        price: Option<f64>,
        /// Volume in millilitres
        #[arg(long)]
        volume: Option<f64>,
        /// Check-in time (YYYY-MM-DD or RFC 3339), defaults to now
        #[arg(long)]
        at: Option<String>,
        /// Matching Untappd check-in
        #[arg(long)]
        untappd: Option<i64>,
    },
    /// List check-ins (current week by default)
    #[command(alias = "ls")]
    List {
        /// Range start, inclusive
        #[arg(long)]
        from: Option<String>,
        /// Range end, exclusive
        #[arg(long)]
        to: Option<String>,
        /// Include deleted check-ins
        #[arg(long)]
        deleted: bool,
    },
    /// Show the last added check-in
    Last,
    /// Delete a check-in (kept as a tombstone)
    #[command(alias = "rm")]
    Delete {
        /// Check-in ID (`site:index`, or an index on this device)
        id: String,
    },
    /// Undo a delete
    Restore {
        /// Check-in ID (`site:index`, or an index on this device)
        id: String,
    },
    /// Show the operation log
    Log {
        /// Only entries after this token
        #[arg(long)]
        since: Option<String>,
        /// Replay the whole log and check it against stored check-ins
        #[arg(long, conflicts_with = "since")]
        verify: bool,
    },
    /// Merge a log exported with `tally --json log` on another device
    Merge {
        /// Exported log file
        file: PathBuf,
    },
    /// Show status (site ID, counts, token)
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, log_file, write_queue_depth, notify_capacity, read_pool_size)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Commands that don't need the store
    match &cli.command {
        Commands::Config { command } => {
            return handle_config_command(command.clone(), config_path, &output);
        }
        Commands::Init { site } => {
            let config = Config::load_with_cli_override(config_path)?;
            return handle_init_command(config, site.as_deref(), &output);
        }
        _ => {}
    }

    let config = Config::load_with_cli_override(config_path)?;
    init_logging(&config);

    let store = Store::open_with_config(config)?;

    match cli.command {
        Commands::Init { .. } | Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Add {
            name,
            style,
            abv,
            price,
            volume,
            at,
            untappd,
        } => {
            let drink = DrinkArgs {
                name,
                style,
                abv,
                price,
                volume,
            };
            commands::checkin::add(&store, drink, at, untappd, &output).await
        }
        Commands::List { from, to, deleted } => {
            commands::checkin::list(&store, from, to, deleted, &output).await
        }
        Commands::Last => commands::checkin::last(&store, &output).await,
        Commands::Delete { id } => commands::checkin::delete(&store, id, &output).await,
        Commands::Restore { id } => commands::checkin::restore(&store, id, &output).await,
        Commands::Log { verify: true, .. } => commands::log::verify(&store, &output).await,
        Commands::Log { since, .. } => commands::log::show(&store, since, &output).await,
        Commands::Merge { file } => commands::log::merge(&store, &file, &output).await,
        Commands::Status => commands::status::show(&store, &output).await,
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&Path>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

fn handle_init_command(config: Config, site: Option<&str>, output: &Output) -> Result<()> {
    let identity = Identity::with_config(config);

    if let Some(site_id) = identity.site_id()? {
        if !output.is_quiet() {
            println!();
            println!("Already initialized.");
            println!("Site ID: {}", site_id);
            println!();
            println!("To start fresh, remove:");
            println!("  {}", identity.data_dir().display());
        }
        return Ok(());
    }

    let result = match site {
        Some(text) => {
            let site_id: SiteId = text
                .parse()
                .with_context(|| format!("Invalid site ID: '{}'", text))?;
            identity.initialize_with(site_id)?
        }
        None => identity.initialize_new()?,
    };

    if output.is_json() {
        output.json(&serde_json::json!({
            "site_id": result.site_id.to_string(),
            "is_new": result.is_new
        }))?;
    } else if output.is_quiet() {
        println!("{}", result.site_id);
    } else {
        println!();
        if result.is_new {
            println!("Created new site identity.");
        } else {
            println!("Restored site identity.");
        }
        println!();
        println!("Site ID: {}", result.site_id);
        println!();
        println!("This ID is stored in: {}", identity.data_dir().display());
        println!("Keep it to restore this device later with: tally init --site <id>");
    }

    Ok(())
}

/// Initialize file logging when TALLY_LOG is set
///
/// TALLY_LOG holds the level (e.g. `debug`). Logs go to `config.log_file`, or
/// `debug.log` in the data directory.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("TALLY_LOG") else {
        return;
    };

    let log_path = config.log_path();
    let log_file = match File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            return;
        }
    };

    let filter = EnvFilter::try_new(format!(
        "tally_core={level},tally_cli={level}",
        level = log_level
    ))
    .unwrap_or_else(|_| EnvFilter::new("tally_core=info,tally_cli=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(log_file))
        .try_init();

    tracing::info!(path = %log_path.display(), "Logging initialized");
}
