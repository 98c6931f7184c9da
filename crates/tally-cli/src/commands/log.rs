//! Operation log command handlers

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use tally_core::{LogEntry, Store, Token};

use crate::output::{Output, OutputFormat};

/// What `tally log --json` prints
#[derive(Debug, Deserialize)]
struct LogDump {
    entries: Vec<LogEntry>,
}

/// Print log entries after `since`
pub async fn show(store: &Store, since: Option<String>, output: &Output) -> Result<()> {
    let since = since
        .as_deref()
        .map(str::parse::<Token>)
        .transpose()
        .context("Invalid token")?;

    let (entries, token) = store
        .entries_since(since.as_ref())
        .await
        .context("Failed to read operation log")?;
    output.print_entries(&entries, &token)
}

/// Replay the log and compare it with the stored records
pub async fn verify(store: &Store, output: &Output) -> Result<()> {
    let mismatches = store
        .verify_log()
        .await
        .context("Failed to verify operation log")?;

    match output.format {
        OutputFormat::Json => {
            let ids: Vec<String> = mismatches.iter().map(|m| m.id.to_string()).collect();
            output.json(&serde_json::json!({
                "consistent": mismatches.is_empty(),
                "mismatched": ids,
            }))?;
        }
        OutputFormat::Quiet => {}
        OutputFormat::Human => {
            if mismatches.is_empty() {
                output.success("Operation log matches stored check-ins");
            } else {
                for mismatch in &mismatches {
                    let state = match (&mismatch.stored, &mismatch.replayed) {
                        (Some(_), Some(_)) => "differs from log",
                        (Some(_), None) => "missing from log",
                        (None, _) => "missing from table",
                    };
                    println!("{} {}", mismatch.id, state);
                }
            }
        }
    }

    if !mismatches.is_empty() {
        bail!("{} check-in(s) disagree with the operation log", mismatches.len());
    }
    Ok(())
}

/// Apply entries exported from another device with `tally --json log`
pub async fn merge(store: &Store, path: &Path, output: &Output) -> Result<()> {
    let entries = read_dump(path)?;
    let total = entries.len();

    let applied = store
        .merge_entries(entries)
        .await
        .context("Failed to merge log entries")?;

    if output.is_json() {
        output.json(&serde_json::json!({ "entries": total, "applied": applied }))
    } else {
        output.success(&format!(
            "Merged {} entr{} ({} check-in(s) changed)",
            total,
            if total == 1 { "y" } else { "ies" },
            applied
        ));
        Ok(())
    }
}

fn read_dump(path: &Path) -> Result<Vec<LogEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    let dump: LogDump = serde_json::from_str(&content)
        .with_context(|| format!("{:?} is not a log export", path))?;
    Ok(dump.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::{Config, Drink, Model};
    use tempfile::TempDir;

    fn open(temp_dir: &TempDir) -> Store {
        Store::open_with_config(Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_export_then_merge() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = open(&dir_a);
        let b = open(&dir_b);

        let saved = a
            .save(Model::new(a.site_id(), Utc::now(), Drink::default()))
            .await
            .unwrap();
        let (entries, token) = a.entries_since(None).await.unwrap();

        // Same shape the JSON output uses
        let dump = serde_json::json!({ "entries": entries, "token": token.to_string() });
        let path = dir_b.path().join("export.json");
        std::fs::write(&path, serde_json::to_string_pretty(&dump).unwrap()).unwrap();

        let output = Output::new(OutputFormat::Quiet);
        merge(&b, &path, &output).await.unwrap();
        assert_eq!(b.get_model(saved.id()).await.unwrap(), Some(saved));

        verify(&b, &output).await.unwrap();
    }

    #[test]
    fn test_read_dump_rejects_other_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("other.json");
        std::fs::write(&path, r#"{"models": []}"#).unwrap();
        assert!(read_dump(&path).is_err());
    }

    #[tokio::test]
    async fn test_show_rejects_bad_token() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        let output = Output::new(OutputFormat::Quiet);
        assert!(show(&store, Some("???".to_string()), &output).await.is_err());
    }
}
