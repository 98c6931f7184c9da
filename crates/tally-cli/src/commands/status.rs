//! Status command handler

use anyhow::{Context, Result};

use tally_core::Store;

use crate::output::{Output, OutputFormat};

/// Show status information
pub async fn show(store: &Store, output: &Output) -> Result<()> {
    let stats = store.stats().await.context("Failed to read store statistics")?;
    let config = store.config();

    match output.format {
        OutputFormat::Json => {
            output.json(&serde_json::json!({
                "site_id": store.site_id().to_string(),
                "data_dir": config.data_dir,
                "database": config.sqlite_path(),
                "counts": {
                    "records": stats.records,
                    "live": stats.records - stats.tombstones,
                    "deleted": stats.tombstones,
                    "log_entries": stats.log_entries
                },
                "token": stats.token.to_string()
            }))?;
        }
        OutputFormat::Quiet => {
            println!("{}", store.site_id());
        }
        OutputFormat::Human => {
            println!("Tally Status");
            println!("============");
            println!();
            println!("Site ID: {}", store.site_id());
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!("  Database: {}", config.sqlite_path().display());
            println!();
            println!("Contents:");
            println!("  Check-ins:   {}", stats.records - stats.tombstones);
            println!("  Deleted:     {}", stats.tombstones);
            println!("  Log entries: {}", stats.log_entries);
            println!();
            println!("Token: {}", stats.token);
        }
    }

    Ok(())
}
