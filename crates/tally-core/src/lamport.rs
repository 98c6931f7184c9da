//! Per-column Lamport counters
//!
//! Every Lamport column stores its value next to a counter that is bumped each
//! time the column is written with a different value, and the site that made
//! that write. When replicas diverge, the strictly higher counter wins; equal
//! counters fall back to the writing site's ordering so every replica picks the
//! same value no matter which one does the merging.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::id::SiteId;

/// Causal counter attached to a single column
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LamportCounter(u32);

impl LamportCounter {
    /// Counter of a column that has never been written
    pub const ZERO: Self = Self(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Next counter value
    #[must_use]
    pub const fn bump(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// A column value with its counter and the site that wrote it
///
/// A site never writes two different values under the same counter, so two
/// equal stamps always carry the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LamportValue<T> {
    pub value: T,
    pub counter: LamportCounter,
    pub site: SiteId,
}

impl<T: PartialEq> LamportValue<T> {
    /// First write of a column
    pub fn initial(value: T, site: SiteId) -> Self {
        Self {
            value,
            counter: LamportCounter::ZERO.bump(),
            site,
        }
    }

    /// Next version of this column, written by `site`
    ///
    /// Writing the current value again keeps counter and site as they are.
    #[must_use]
    pub fn write(&self, value: T, site: SiteId) -> Self
    where
        T: Clone,
    {
        if value == self.value {
            return self.clone();
        }
        Self {
            value,
            counter: self.counter.bump(),
            site,
        }
    }
}

impl<T> LamportValue<T> {
    /// Counter first, then writing site
    fn stamp(&self) -> (LamportCounter, SiteId) {
        (self.counter, self.site)
    }
}

/// Pick the winning version of a column
///
/// Higher counter wins, then higher writing site. Identical stamps keep `a`;
/// they hold the same value, so the result never depends on argument order.
pub fn resolve<T>(a: LamportValue<T>, b: LamportValue<T>) -> LamportValue<T> {
    match b.stamp().cmp(&a.stamp()) {
        Ordering::Greater => b,
        Ordering::Less | Ordering::Equal => a,
    }
}
