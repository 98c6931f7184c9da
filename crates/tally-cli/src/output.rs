//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use anyhow::{Context, Result};
use serde::Serialize;

use tally_core::{LogEntry, Model, Token};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Check if output is JSON
    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value).context("Failed to encode JSON output")?;
        println!("{}", text);
        Ok(())
    }

    /// Print a single check-in
    pub fn print_model(&self, model: &Model) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                let drink = &model.check_in.drink;
                println!("ID:       {}", model.id());
                println!("Time:     {}", model.check_in.time.format("%Y-%m-%d %H:%M"));
                println!("Drink:    {}", drink_label(model));
                println!("ABV:      {:.1}%", drink.abv);
                println!("Volume:   {:.0} ml", drink.volume);
                println!("Price:    {:.2}", drink.price);
                if let Some(untappd) = model.check_in.untappd_id {
                    println!("Untappd:  {}", untappd.0);
                }
                println!(
                    "Created:  {}",
                    model.metadata.creation_time.format("%Y-%m-%d %H:%M")
                );
                if model.is_deleted() {
                    println!("State:    deleted");
                }
                Ok(())
            }
            OutputFormat::Json => self.json(model),
            OutputFormat::Quiet => {
                println!("{}", model.id());
                Ok(())
            }
        }
    }

    /// Print a list of check-ins and the token they were read at
    pub fn print_models(&self, models: &[Model], token: &Token) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if models.is_empty() {
                    println!("No check-ins found.");
                } else {
                    for model in models {
                        let marker = if model.is_deleted() { " (deleted)" } else { "" };
                        println!(
                            "{} | {} | {:<24} | {:>5.1}% | {:>6.2}{}",
                            short_id(model),
                            model.check_in.time.format("%a %m-%d %H:%M"),
                            truncate(&drink_label(model), 24),
                            model.check_in.drink.abv,
                            model.check_in.drink.price,
                            marker
                        );
                    }
                    let total: f64 = models.iter().map(|m| m.check_in.drink.price).sum();
                    println!("\n{} check-in(s), {:.2} spent", models.len(), total);
                }
                println!("Token: {}", token);
                Ok(())
            }
            OutputFormat::Json => self.json(&serde_json::json!({
                "models": models,
                "token": token.to_string(),
            })),
            OutputFormat::Quiet => {
                for model in models {
                    println!("{}", model.id());
                }
                Ok(())
            }
        }
    }

    /// Print operation log entries and the new tail token
    ///
    /// JSON output is the format `tally merge` reads back.
    pub fn print_entries(&self, entries: &[LogEntry], token: &Token) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No new log entries.");
                }
                for entry in entries {
                    let action = entry.action_id.to_string();
                    println!(
                        "{:>6} | {} | {}#{} | {} | {}",
                        entry.position,
                        entry.committed_at.format("%Y-%m-%d %H:%M:%S"),
                        &action[..8],
                        entry.action_index,
                        entry.record_id,
                        if entry.payload.is_deleted() {
                            "deleted"
                        } else {
                            "saved"
                        }
                    );
                }
                println!("Token: {}", token);
                Ok(())
            }
            OutputFormat::Json => self.json(&serde_json::json!({
                "entries": entries,
                "token": token.to_string(),
            })),
            OutputFormat::Quiet => {
                println!("{}", token);
                Ok(())
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Drink name, falling back to its style
fn drink_label(model: &Model) -> String {
    let drink = &model.check_in.drink;
    match drink.name {
        Some(ref name) => format!("{} ({})", name, drink.style),
        None => drink.style.to_string(),
    }
}

/// Operation index for local display, with the site abbreviated
fn short_id(model: &Model) -> String {
    let id = model.id();
    let site = id.site_id.to_string();
    format!("{}:{:<4}", &site[..8], id.operation_index)
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
