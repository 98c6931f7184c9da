//! Globally unique record identifiers
//!
//! A record is identified by the site (replica) that created it plus an
//! operation index scoped to that site. Records created locally start out with
//! the wildcard index; the store swaps in a concrete index inside the same
//! write transaction that first persists the row.
//!
//! Text form is `<site>:<index>`, or `<site>:*` while the index is still the
//! wildcard.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Sentinel operation index for a record that has not been committed yet
pub const WILDCARD_INDEX: u32 = u32::MAX;

/// Highest operation index a store ever assigns
///
/// Indices above it, up to the wildcard, are reserved. A record claiming one
/// was not issued by any store.
pub const MAX_OPERATION_INDEX: u32 = WILDCARD_INDEX / 2;

/// Errors produced while issuing, finalizing, or parsing identifiers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identity already carries a concrete operation index
    #[error("Identity {0} is already finalized")]
    AlreadyFinalized(GlobalId),

    /// Tried to finalize using the wildcard itself
    #[error("Cannot finalize an identity with the wildcard index")]
    WildcardAssignment,

    /// Operation index in the reserved range
    #[error("Operation index {0} is above the assignable maximum")]
    IndexOutOfRange(u32),

    /// Site ID text is not a UUID
    #[error("Invalid site ID '{0}'")]
    InvalidSite(String),

    /// Global ID text is not `<site>:<index>`
    #[error("Invalid global ID '{0}': expected <site>:<index>")]
    InvalidFormat(String),
}

/// Identifier of a replica (device) that writes records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(Uuid);

impl SiteId {
    /// Generate a fresh random site ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SiteId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| IdError::InvalidSite(s.to_string()))
    }
}

/// Site-scoped record identifier
///
/// Ordering is by `(site_id, operation_index)`, which gives every replica the
/// same total order for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalId {
    /// Site that created the record
    pub site_id: SiteId,
    /// Index scoped to `site_id`, or [`WILDCARD_INDEX`] before first commit
    pub operation_index: u32,
}

impl GlobalId {
    /// Build an identifier from its parts
    pub const fn new(site_id: SiteId, operation_index: u32) -> Self {
        Self {
            site_id,
            operation_index,
        }
    }

    /// Issue a not-yet-committed identifier for a new local record
    pub const fn issue(site_id: SiteId) -> Self {
        Self::new(site_id, WILDCARD_INDEX)
    }

    /// Whether the operation index is still the wildcard
    pub const fn is_wildcard(&self) -> bool {
        self.operation_index == WILDCARD_INDEX
    }

    /// Whether the index is one a store could have assigned
    pub const fn is_assignable(&self) -> bool {
        self.operation_index <= MAX_OPERATION_INDEX
    }

    /// Replace the wildcard with a concrete index
    ///
    /// Must only be called inside the transaction that persists the record.
    pub fn finalize(self, assigned_index: u32) -> Result<Self, IdError> {
        if !self.is_wildcard() {
            return Err(IdError::AlreadyFinalized(self));
        }
        if assigned_index == WILDCARD_INDEX {
            return Err(IdError::WildcardAssignment);
        }
        if assigned_index > MAX_OPERATION_INDEX {
            return Err(IdError::IndexOutOfRange(assigned_index));
        }
        Ok(Self::new(self.site_id, assigned_index))
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            write!(f, "{}:*", self.site_id)
        } else {
            write!(f, "{}:{}", self.site_id, self.operation_index)
        }
    }
}

impl FromStr for GlobalId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (site, index) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| IdError::InvalidFormat(s.to_string()))?;

        let site_id = site.parse()?;
        let operation_index = match index {
            "*" => WILDCARD_INDEX,
            _ => index
                .parse()
                .map_err(|_| IdError::InvalidFormat(s.to_string()))?,
        };

        Ok(Self::new(site_id, operation_index))
    }
}
