//! Physical record rows
//!
//! A [`RecordRow`] is what the primary table stores for one record: the
//! immutable identity and creation time, plus one [`LamportValue`] per Lamport
//! column carrying the site that last changed it. Saving a [`Model`] produces
//! a new row version through [`RecordRow::next_version`]; merging two
//! replicas' versions goes through [`RecordRow::merge`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{GlobalId, SiteId};
use crate::lamport::{resolve, LamportValue};
use crate::models::{CheckIn, Drink, DrinkStyle, Metadata, Model, UntappdId};

/// Lamport columns, in schema order
pub const LAMPORT_COLUMNS: [&str; 8] = [
    "deleted",
    "untappd_id",
    "time",
    "name",
    "style",
    "abv",
    "price",
    "volume",
];

/// One version of a record as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub id: GlobalId,
    pub creation_time: DateTime<Utc>,
    pub deleted: LamportValue<bool>,
    pub untappd_id: LamportValue<Option<UntappdId>>,
    pub time: LamportValue<DateTime<Utc>>,
    pub name: LamportValue<Option<String>>,
    pub style: LamportValue<DrinkStyle>,
    pub abv: LamportValue<f64>,
    pub price: LamportValue<f64>,
    pub volume: LamportValue<f64>,
}

impl RecordRow {
    /// First version of a record written by `site`; every counter starts at 1
    pub fn first_version(id: GlobalId, model: &Model, site: SiteId) -> Self {
        let check_in = &model.check_in;
        let drink = &check_in.drink;
        Self {
            id,
            creation_time: truncate_to_millis(model.metadata.creation_time),
            deleted: LamportValue::initial(model.metadata.deleted, site),
            untappd_id: LamportValue::initial(check_in.untappd_id, site),
            time: LamportValue::initial(truncate_to_millis(check_in.time), site),
            name: LamportValue::initial(drink.name.clone(), site),
            style: LamportValue::initial(drink.style, site),
            abv: LamportValue::initial(drink.abv, site),
            price: LamportValue::initial(drink.price, site),
            volume: LamportValue::initial(drink.volume, site),
        }
    }

    /// The version that results from `site` saving `model` over this one
    ///
    /// Counters are bumped, and the writer recorded, for changed columns only.
    /// Identity and creation time are kept from `self`.
    #[must_use]
    pub fn next_version(&self, model: &Model, site: SiteId) -> Self {
        let check_in = &model.check_in;
        let drink = &check_in.drink;
        Self {
            id: self.id,
            creation_time: self.creation_time,
            deleted: self.deleted.write(model.metadata.deleted, site),
            untappd_id: self.untappd_id.write(check_in.untappd_id, site),
            time: self.time.write(truncate_to_millis(check_in.time), site),
            name: self.name.write(drink.name.clone(), site),
            style: self.style.write(drink.style, site),
            abv: self.abv.write(drink.abv, site),
            price: self.price.write(drink.price, site),
            volume: self.volume.write(drink.volume, site),
        }
    }

    /// Field-level merge of two versions of the same record
    ///
    /// Each Lamport column is resolved on its own stamp, so concurrent edits to
    /// different columns both survive and the outcome does not depend on which
    /// replica merges.
    #[must_use]
    pub fn merge(self, other: RecordRow) -> Self {
        Self {
            id: self.id,
            creation_time: self.creation_time.min(other.creation_time),
            deleted: resolve(self.deleted, other.deleted),
            untappd_id: resolve(self.untappd_id, other.untappd_id),
            time: resolve(self.time, other.time),
            name: resolve(self.name, other.name),
            style: resolve(self.style, other.style),
            abv: resolve(self.abv, other.abv),
            price: resolve(self.price, other.price),
            volume: resolve(self.volume, other.volume),
        }
    }

    /// Names of the Lamport columns whose value differs from `other`
    pub fn changed_columns(&self, other: &RecordRow) -> Vec<&'static str> {
        let flags = [
            self.deleted.value != other.deleted.value,
            self.untappd_id.value != other.untappd_id.value,
            self.time.value != other.time.value,
            self.name.value != other.name.value,
            self.style.value != other.style.value,
            self.abv.value != other.abv.value,
            self.price.value != other.price.value,
            self.volume.value != other.volume.value,
        ];
        LAMPORT_COLUMNS
            .into_iter()
            .zip(flags)
            .filter_map(|(column, changed)| changed.then_some(column))
            .collect()
    }

    /// Check the drink the way a save would
    pub fn validate(&self) -> Result<(), String> {
        self.to_model().check_in.drink.validate()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.value
    }

    pub fn to_model(&self) -> Model {
        self.clone().into_model()
    }

    pub fn into_model(self) -> Model {
        Model {
            metadata: Metadata {
                id: self.id,
                creation_time: self.creation_time,
                deleted: self.deleted.value,
            },
            check_in: CheckIn {
                untappd_id: self.untappd_id.value,
                time: self.time.value,
                drink: Drink {
                    name: self.name.value,
                    style: self.style.value,
                    abv: self.abv.value,
                    price: self.price.value,
                    volume: self.volume.value,
                },
            },
        }
    }
}

/// Drop sub-millisecond precision; timestamps are stored as epoch millis
pub fn truncate_to_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap_or(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn site(n: u128) -> SiteId {
        SiteId::from_uuid(Uuid::from_u128(n))
    }

    fn sample_model(site_id: SiteId) -> Model {
        Model::new(site_id, Utc::now(), Drink::default())
    }

    fn base_row(model: &Model) -> RecordRow {
        RecordRow::first_version(GlobalId::new(site(1), 0), model, site(1))
    }

    #[test]
    fn test_first_version_counters_start_at_one() {
        let model = sample_model(site(1));
        let row = base_row(&model);
        assert_eq!(row.abv.counter.value(), 1);
        assert_eq!(row.deleted.counter.value(), 1);
        assert_eq!(row.price.site, site(1));
        assert_eq!(row.to_model().check_in.drink, model.check_in.drink);
    }

    #[test]
    fn test_next_version_bumps_changed_columns_only() {
        let mut model = sample_model(site(1));
        let row = base_row(&model);

        model.check_in.drink.price = 9.0;
        model.check_in.drink.name = Some("Pilsner".into());
        let next = row.next_version(&model, site(2));

        assert_eq!(next.price.counter.value(), 2);
        assert_eq!(next.price.site, site(2));
        assert_eq!(next.name.counter.value(), 2);
        assert_eq!(next.abv.counter.value(), 1);
        assert_eq!(next.abv.site, site(1));
        assert_eq!(next.time.counter.value(), 1);
        assert_eq!(next.changed_columns(&row), vec!["name", "price"]);
    }

    #[test]
    fn test_next_version_keeps_identity_and_creation_time() {
        let model = sample_model(site(1));
        let row = RecordRow::first_version(GlobalId::new(site(1), 3), &model, site(1));

        let mut other = model.clone();
        other.metadata.creation_time = Utc::now() + Duration::days(3);
        let next = row.next_version(&other, site(1));

        assert_eq!(next.id, row.id);
        assert_eq!(next.creation_time, row.creation_time);
    }

    #[test]
    fn test_merge_is_field_level() {
        let model = sample_model(site(1));
        let base = base_row(&model);

        // Replica 1 changes the price, replica 2 changes the name
        let mut m1 = model.clone();
        m1.check_in.drink.price = 7.5;
        let v1 = base.next_version(&m1, site(1));

        let mut m2 = model.clone();
        m2.check_in.drink.name = Some("Stout".into());
        let v2 = base.next_version(&m2, site(2));

        let merged = v1.clone().merge(v2.clone());
        assert_eq!(merged.price.value, 7.5);
        assert_eq!(merged.name.value.as_deref(), Some("Stout"));

        let reversed = v2.merge(v1);
        assert_eq!(merged, reversed);
    }

    #[test]
    fn test_merge_conflict_uses_writing_site() {
        let model = sample_model(site(1));
        let base = base_row(&model);

        let mut m1 = model.clone();
        m1.check_in.drink.price = 1.0;
        let v1 = base.next_version(&m1, site(1));

        let mut m2 = model.clone();
        m2.check_in.drink.price = 2.0;
        let v2 = base.next_version(&m2, site(2));

        let merged = v1.clone().merge(v2.clone());
        assert_eq!(merged.price.value, 2.0);
        assert_eq!(merged.price.counter.value(), 2);
        assert_eq!(merged.price.site, site(2));

        // A third replica merging the merged row keeps the same winner
        let again = v1.merge(merged.clone()).merge(v2);
        assert_eq!(again, merged);
    }

    #[test]
    fn test_validate_checks_drink() {
        let model = sample_model(site(1));
        let mut row = base_row(&model);
        assert!(row.validate().is_ok());

        row.abv.value = 500.0;
        assert!(row.validate().is_err());
    }

    #[test]
    fn test_times_truncated_to_millis() {
        let mut model = sample_model(site(1));
        model.check_in.time = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let row = base_row(&model);
        assert_eq!(row.time.value.timestamp_subsec_nanos(), 123_000_000);
    }
}
