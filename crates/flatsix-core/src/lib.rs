//! Canonical domain model for single-marque auction listings.

use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "flatsix-core";

/// The single marque this pipeline tracks. Everything else is out of domain.
pub const TRACKED_MAKE: &str = "Porsche";

/// No listing predates the 356.
pub const EARLIEST_MODEL_YEAR: i32 = 1948;

/// Model years run one ahead of the calendar.
pub fn latest_model_year(now: DateTime<Utc>) -> i32 {
    now.year() + 1
}

/// Supported marketplaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    BringATrailer,
    CarsAndBids,
    Pcarmarket,
    CollectingCars,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::BringATrailer,
        Source::CarsAndBids,
        Source::Pcarmarket,
        Source::CollectingCars,
    ];

    /// Stable key used in checkpoints, reports and database rows.
    pub fn key(&self) -> &'static str {
        match self {
            Source::BringATrailer => "bring-a-trailer",
            Source::CarsAndBids => "cars-and-bids",
            Source::Pcarmarket => "pcarmarket",
            Source::CollectingCars => "collecting-cars",
        }
    }

    pub fn parse(input: &str) -> Option<Source> {
        let needle = input.trim().to_ascii_lowercase();
        Source::ALL.iter().copied().find(|s| s.key() == needle)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Lifecycle of an auction listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Sold,
    Unsold,
    Delisted,
    Draft,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Sold => "sold",
            ListingStatus::Unsold => "unsold",
            ListingStatus::Delisted => "delisted",
            ListingStatus::Draft => "draft",
        }
    }

    pub fn parse(input: &str) -> Option<ListingStatus> {
        match input.trim().to_ascii_lowercase().as_str() {
            "active" => Some(ListingStatus::Active),
            "sold" => Some(ListingStatus::Sold),
            "unsold" => Some(ListingStatus::Unsold),
            "delisted" => Some(ListingStatus::Delisted),
            "draft" => Some(ListingStatus::Draft),
            _ => None,
        }
    }

    /// An auction that has ended never reopens.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ListingStatus::Sold | ListingStatus::Unsold | ListingStatus::Delisted
        )
    }

    /// Status transitions only move forward: a terminal status keeps itself
    /// when the incoming value would revert to active/draft.
    pub fn advance(self, incoming: ListingStatus) -> ListingStatus {
        if self.is_terminal() && !incoming.is_terminal() {
            self
        } else {
            incoming
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The normalized unit of work. Uniquely identified by
/// `(source, source_id, source_url)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalListing {
    pub source: Source,
    pub source_id: String,
    pub source_url: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub title: String,
    pub status: ListingStatus,
    pub sale_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hammer_price_usd: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_bid_usd: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_price_usd: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auction_house: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    /// Original upstream payload, retained for forensic reprocessing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<JsonValue>,
    pub scraped_at: DateTime<Utc>,
}

impl CanonicalListing {
    pub fn identity_key(&self) -> (Source, &str, &str) {
        (self.source, &self.source_id, &self.source_url)
    }

    /// Returns the names of violated schema fields, empty when the listing
    /// conforms. Validation never panics on odd input.
    pub fn validate(&self, now: DateTime<Utc>) -> Vec<&'static str> {
        let mut violations = Vec::new();
        if self.source_id.trim().is_empty() {
            violations.push("source_id");
        }
        if !is_well_formed_url(&self.source_url) {
            violations.push("source_url");
        }
        if !self.make.eq_ignore_ascii_case(TRACKED_MAKE) {
            violations.push("make");
        }
        if self.model.trim().is_empty() {
            violations.push("model");
        }
        if self.year < EARLIEST_MODEL_YEAR || self.year > latest_model_year(now) {
            violations.push("year");
        }
        if self.title.trim().is_empty() {
            violations.push("title");
        }
        violations
    }
}

pub fn is_well_formed_url(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    (trimmed.starts_with("https://") || trimmed.starts_with("http://"))
        && trimmed.len() > "https://x".len()
}

/// Why a raw record was dropped instead of persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingRequiredFields,
    NonDomainMatch,
    MissingYearOrModel,
    SchemaValidationFailed,
    NotActive,
    NotSold,
    MissingSaleDate,
    OutsideSoldWindow,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingRequiredFields => "missing_required_fields",
            RejectReason::NonDomainMatch => "non_domain_match",
            RejectReason::MissingYearOrModel => "missing_year_or_model",
            RejectReason::SchemaValidationFailed => "schema_validation_failed",
            RejectReason::NotActive => "not_active",
            RejectReason::NotSold => "not_sold",
            RejectReason::MissingSaleDate => "missing_sale_date",
            RejectReason::OutsideSoldWindow => "outside_sold_window",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured record of one dropped raw item. Lives for the duration of a
/// run and lands in the reject log, never in the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeReject {
    pub source: Source,
    pub reason: RejectReason,
    pub raw: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl NormalizeReject {
    pub fn new(source: Source, reason: RejectReason, raw: JsonValue) -> Self {
        Self {
            source,
            reason,
            raw,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn listing() -> CanonicalListing {
        CanonicalListing {
            source: Source::BringATrailer,
            source_id: "123".into(),
            source_url: "https://bringatrailer.com/listing/2004-porsche-911-gt3".into(),
            make: "Porsche".into(),
            model: "911".into(),
            year: 2004,
            title: "2004 Porsche 911 GT3".into(),
            status: ListingStatus::Sold,
            sale_date: None,
            vin: None,
            hammer_price_usd: None,
            current_bid_usd: Some(156_000),
            final_price_usd: None,
            bid_count: None,
            currency: Some("USD".into()),
            mileage: None,
            mileage_unit: None,
            city: None,
            region: None,
            country: None,
            auction_house: None,
            description: None,
            image_urls: Vec::new(),
            raw: None,
            scraped_at: now(),
        }
    }

    #[test]
    fn conforming_listing_has_no_violations() {
        assert!(listing().validate(now()).is_empty());
    }

    #[test]
    fn year_outside_plausible_range_is_flagged() {
        let mut early = listing();
        early.year = 1930;
        assert_eq!(early.validate(now()), vec!["year"]);

        let mut late = listing();
        late.year = 2028;
        assert_eq!(late.validate(now()), vec!["year"]);

        let mut next_model_year = listing();
        next_model_year.year = 2027;
        assert!(next_model_year.validate(now()).is_empty());
    }

    #[test]
    fn off_marque_make_is_flagged() {
        let mut wrong = listing();
        wrong.make = "Ferrari".into();
        assert_eq!(wrong.validate(now()), vec!["make"]);

        let mut case_insensitive = listing();
        case_insensitive.make = "PORSCHE".into();
        assert!(case_insensitive.validate(now()).is_empty());
    }

    #[test]
    fn bare_or_schemeless_url_is_flagged() {
        let mut bad = listing();
        bad.source_url = "bringatrailer.com/listing/no-scheme".into();
        assert_eq!(bad.validate(now()), vec!["source_url"]);
    }

    #[test]
    fn terminal_status_never_reverts() {
        assert_eq!(
            ListingStatus::Sold.advance(ListingStatus::Active),
            ListingStatus::Sold
        );
        assert_eq!(
            ListingStatus::Unsold.advance(ListingStatus::Draft),
            ListingStatus::Unsold
        );
        assert_eq!(
            ListingStatus::Active.advance(ListingStatus::Sold),
            ListingStatus::Sold
        );
        assert_eq!(
            ListingStatus::Sold.advance(ListingStatus::Delisted),
            ListingStatus::Delisted
        );
    }

    #[test]
    fn source_keys_round_trip() {
        for source in Source::ALL {
            assert_eq!(Source::parse(source.key()), Some(source));
        }
        assert_eq!(Source::parse("Bring-A-Trailer"), Some(Source::BringATrailer));
        assert_eq!(Source::parse("craigslist"), None);
    }
}
