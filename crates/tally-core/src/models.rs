//! Data models for Tally
//!
//! A [`Model`] is one logged drink: record [`Metadata`] (identity, creation
//! time, tombstone flag) plus the [`CheckIn`] itself.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{GlobalId, SiteId};

/// Kind of drink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrinkStyle {
    #[default]
    Beer,
    Wine,
    Sake,
    Cider,
    Mead,
    Spirit,
    Cocktail,
}

impl DrinkStyle {
    pub const ALL: [DrinkStyle; 7] = [
        DrinkStyle::Beer,
        DrinkStyle::Wine,
        DrinkStyle::Sake,
        DrinkStyle::Cider,
        DrinkStyle::Mead,
        DrinkStyle::Spirit,
        DrinkStyle::Cocktail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DrinkStyle::Beer => "beer",
            DrinkStyle::Wine => "wine",
            DrinkStyle::Sake => "sake",
            DrinkStyle::Cider => "cider",
            DrinkStyle::Mead => "mead",
            DrinkStyle::Spirit => "spirit",
            DrinkStyle::Cocktail => "cocktail",
        }
    }

    /// Typical ABV in percent
    pub fn default_abv(&self) -> f64 {
        match self {
            DrinkStyle::Beer => 5.0,
            DrinkStyle::Wine => 12.0,
            DrinkStyle::Sake => 15.0,
            DrinkStyle::Cider => 5.5,
            DrinkStyle::Mead => 12.0,
            DrinkStyle::Spirit => 40.0,
            DrinkStyle::Cocktail => 15.0,
        }
    }

    /// Typical serving in millilitres
    pub fn default_volume(&self) -> f64 {
        match self {
            DrinkStyle::Beer => 355.0,
            DrinkStyle::Wine => 150.0,
            DrinkStyle::Sake => 180.0,
            DrinkStyle::Cider => 355.0,
            DrinkStyle::Mead => 150.0,
            DrinkStyle::Spirit => 44.0,
            DrinkStyle::Cocktail => 120.0,
        }
    }
}

impl fmt::Display for DrinkStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrinkStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        DrinkStyle::ALL
            .into_iter()
            .find(|style| style.as_str() == needle)
            .ok_or_else(|| format!("Unknown drink style: '{}'", s))
    }
}

/// A drink as it was poured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drink {
    /// Optional label, e.g. the beer's name
    pub name: Option<String>,
    pub style: DrinkStyle,
    /// Alcohol by volume, percent
    pub abv: f64,
    pub price: f64,
    /// Millilitres
    pub volume: f64,
}

impl Drink {
    /// A drink with the style's typical ABV and volume
    pub fn of_style(style: DrinkStyle, price: f64) -> Self {
        Self {
            name: None,
            style,
            abv: style.default_abv(),
            price,
            volume: style.default_volume(),
        }
    }

    /// Check the numeric fields are in range
    pub fn validate(&self) -> Result<(), String> {
        if !self.abv.is_finite() || !(0.0..=100.0).contains(&self.abv) {
            return Err(format!("ABV must be between 0 and 100, got {}", self.abv));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(format!("Price must be non-negative, got {}", self.price));
        }
        if !self.volume.is_finite() || self.volume <= 0.0 {
            return Err(format!("Volume must be positive, got {}", self.volume));
        }
        Ok(())
    }
}

impl Default for Drink {
    fn default() -> Self {
        Self::of_style(DrinkStyle::default(), 5.0)
    }
}

/// Reference to the same check-in on Untappd
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UntappdId(pub i64);

/// A single check-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub untappd_id: Option<UntappdId>,
    /// When the drink was had
    pub time: DateTime<Utc>,
    pub drink: Drink,
}

/// Record bookkeeping shared by every model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: GlobalId,
    /// When the record was first created (not the check-in time)
    pub creation_time: DateTime<Utc>,
    /// Tombstone flag; deleted records are kept
    #[serde(default)]
    pub deleted: bool,
}

/// Whether the latest version of a record is live or tombstoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Active,
    Tombstoned,
}

/// The unit saved to and returned from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub metadata: Metadata,
    pub check_in: CheckIn,
}

impl Model {
    /// Create a new, not-yet-saved model owned by `site_id`
    pub fn new(site_id: SiteId, time: DateTime<Utc>, drink: Drink) -> Self {
        Self {
            metadata: Metadata {
                id: GlobalId::issue(site_id),
                creation_time: Utc::now(),
                deleted: false,
            },
            check_in: CheckIn {
                untappd_id: None,
                time,
                drink,
            },
        }
    }

    /// Attach an Untappd reference
    #[must_use]
    pub fn with_untappd_id(mut self, id: UntappdId) -> Self {
        self.check_in.untappd_id = Some(id);
        self
    }

    pub fn id(&self) -> GlobalId {
        self.metadata.id
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deleted
    }

    pub fn state(&self) -> RecordState {
        if self.metadata.deleted {
            RecordState::Tombstoned
        } else {
            RecordState::Active
        }
    }

    /// Mark as deleted; the change is persisted by saving
    pub fn tombstone(&mut self) {
        self.metadata.deleted = true;
    }

    /// Clear the deleted flag; the change is persisted by saving
    pub fn restore(&mut self) {
        self.metadata.deleted = false;
    }
}
