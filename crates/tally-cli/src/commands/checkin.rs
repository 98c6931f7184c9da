//! Check-in command handlers

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

use tally_core::{Drink, DrinkStyle, GlobalId, Model, RangeObserver, Store, UntappdId};

use crate::output::Output;

/// Drink fields given on the command line
#[derive(Debug, Default)]
pub struct DrinkArgs {
    pub name: Option<String>,
    pub style: Option<DrinkStyle>,
    pub abv: Option<f64>,
    pub price: Option<f64>,
    pub volume: Option<f64>,
}

impl DrinkArgs {
    /// Fill unspecified fields from `base`
    ///
    /// Picking a different style starts from that style's defaults, keeping
    /// only the price.
    fn apply(self, base: Drink) -> Drink {
        let mut drink = match self.style {
            Some(style) if style != base.style => Drink::of_style(style, base.price),
            _ => base,
        };
        if let Some(name) = self.name {
            drink.name = if name.is_empty() { None } else { Some(name) };
        }
        if let Some(abv) = self.abv {
            drink.abv = abv;
        }
        if let Some(price) = self.price {
            drink.price = price;
        }
        if let Some(volume) = self.volume {
            drink.volume = volume;
        }
        drink
    }
}

/// Save a new check-in
///
/// Unspecified drink fields repeat the last added check-in's drink.
pub async fn add(
    store: &Store,
    drink: DrinkArgs,
    at: Option<String>,
    untappd: Option<i64>,
    output: &Output,
) -> Result<()> {
    let time = match at {
        Some(text) => parse_time(&text)?,
        None => Utc::now(),
    };

    let base = store
        .get_last_added_model()
        .await
        .context("Failed to read last check-in")?
        .map(|model| model.check_in.drink)
        .unwrap_or_default();

    let mut model = Model::new(store.site_id(), time, drink.apply(base));
    if let Some(id) = untappd {
        model = model.with_untappd_id(UntappdId(id));
    }

    let saved = store.save(model).await.context("Failed to save check-in")?;

    if output.is_json() {
        output.print_model(&saved)?;
    } else if output.is_quiet() {
        println!("{}", saved.id());
    } else {
        output.success(&format!("Checked in {}", saved.id()));
    }
    Ok(())
}

/// List check-ins in a range, the current week by default
pub async fn list(
    store: &Store,
    from: Option<String>,
    to: Option<String>,
    include_deleted: bool,
    output: &Output,
) -> Result<()> {
    let (week_start, week_end) = week_bounds(Utc::now());
    let from = from.as_deref().map(parse_time).transpose()?.unwrap_or(week_start);
    let to = to.as_deref().map(parse_time).transpose()?.unwrap_or(week_end);
    if from > to {
        bail!("--from must not be after --to");
    }

    let mut observer = RangeObserver::new(from, to);
    if include_deleted {
        observer = observer.including_deleted();
    }
    observer
        .refresh(store)
        .await
        .context("Failed to list check-ins")?;

    let token = observer
        .token()
        .context("Range refresh returned no token")?;
    output.print_models(observer.models(), token)
}

/// Show the most recently added check-in
pub async fn last(store: &Store, output: &Output) -> Result<()> {
    match store
        .get_last_added_model()
        .await
        .context("Failed to read last check-in")?
    {
        Some(model) => output.print_model(&model),
        None => {
            output.message("No check-ins yet.");
            Ok(())
        }
    }
}

/// Tombstone a check-in
pub async fn delete(store: &Store, id: String, output: &Output) -> Result<()> {
    let id = parse_id(store, &id)?;
    let model = store
        .delete(id)
        .await
        .with_context(|| format!("Failed to delete {}", id))?;
    if output.is_json() {
        output.print_model(&model)
    } else {
        output.success(&format!("Deleted {}", id));
        Ok(())
    }
}

/// Undo a delete
pub async fn restore(store: &Store, id: String, output: &Output) -> Result<()> {
    let id = parse_id(store, &id)?;
    let model = store
        .restore(id)
        .await
        .with_context(|| format!("Failed to restore {}", id))?;
    if output.is_json() {
        output.print_model(&model)
    } else {
        output.success(&format!("Restored {}", id));
        Ok(())
    }
}

/// Parse a record ID
///
/// A bare number is an operation index on this device's site.
fn parse_id(store: &Store, text: &str) -> Result<GlobalId> {
    let id = match text.trim().parse::<u32>() {
        Ok(index) => GlobalId::new(store.site_id(), index),
        Err(_) => text
            .parse::<GlobalId>()
            .with_context(|| format!("Invalid check-in ID: '{}'", text))?,
    };
    if id.is_wildcard() {
        bail!("'{}' does not name a saved check-in", text);
    }
    Ok(id)
}

/// Parse a date (`YYYY-MM-DD`, midnight UTC) or an RFC 3339 timestamp
pub fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)));
    }
    DateTime::parse_from_rfc3339(text)
        .map(|time| time.with_timezone(&Utc))
        .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD or RFC 3339.", text))
}

/// Monday 00:00 UTC of the week containing `now`, and the Monday after
pub fn week_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let days_from_monday = i64::from(now.weekday().num_days_from_monday());
    let monday = now.date_naive() - Duration::days(days_from_monday);
    let start = Utc.from_utc_datetime(&monday.and_time(chrono::NaiveTime::MIN));
    (start, start + Duration::days(7))
}
