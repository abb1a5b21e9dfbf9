//! Repository writer: idempotent upserts into the primary listings table
//! with best-effort fan-out into the normalized child relations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use flatsix_core::{CanonicalListing, ListingStatus, Source};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "flatsix-db";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: u32,
    pub updated: u32,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Upsert contract against the relational store. `inserted=1` only when the
/// primary row did not previously exist; child-table failures surface as
/// warnings, never as errors.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn upsert(
        &self,
        listing: &CanonicalListing,
        dry_run: bool,
    ) -> Result<UpsertOutcome, StoreError>;
}

/// Hour-truncated bucket for price-history points, so repeated runs within
/// the same hour collapse onto one time-series row.
pub fn price_history_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

/// The price a run observed for a listing, in preference order.
pub fn observed_price(listing: &CanonicalListing) -> Option<i64> {
    listing
        .final_price_usd
        .or(listing.hammer_price_usd)
        .or(listing.current_bid_usd)
}

pub struct PostgresListingStore {
    pool: PgPool,
}

impl PostgresListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn find_existing(
        &self,
        listing: &CanonicalListing,
    ) -> Result<Option<(i64, ListingStatus)>, StoreError> {
        let by_identity = sqlx::query(
            "SELECT id, status FROM listings WHERE source = $1 AND source_id = $2",
        )
        .bind(listing.source.key())
        .bind(&listing.source_id)
        .fetch_optional(&self.pool)
        .await?;

        // Upstream identifiers drift; the URL is the fallback identity.
        let row = match by_identity {
            Some(row) => Some(row),
            None => {
                sqlx::query("SELECT id, status FROM listings WHERE source_url = $1")
                    .bind(&listing.source_url)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        Ok(row.map(|row| {
            let id: i64 = row.get("id");
            let status: String = row.get("status");
            let status = ListingStatus::parse(&status).unwrap_or(ListingStatus::Draft);
            (id, status)
        }))
    }

    async fn update_row(
        &self,
        id: i64,
        listing: &CanonicalListing,
        status: ListingStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE listings
               SET source_id = $2,
                   source_url = $3,
                   make = $4,
                   model = $5,
                   year = $6,
                   title = $7,
                   status = $8,
                   sale_date = $9,
                   scraped_at = $10,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&listing.source_id)
        .bind(&listing.source_url)
        .bind(&listing.make)
        .bind(&listing.model)
        .bind(listing.year)
        .bind(&listing.title)
        .bind(status.as_str())
        .bind(listing.sale_date)
        .bind(listing.scraped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_row(&self, listing: &CanonicalListing) -> Result<i64, StoreError> {
        // The conflict arm guards a racing writer; forward-only status is
        // enforced there as well.
        let row = sqlx::query(
            r#"
            INSERT INTO listings
                (source, source_id, source_url, make, model, year, title,
                 status, sale_date, scraped_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source, source_id) DO UPDATE SET
                source_url = EXCLUDED.source_url,
                make = EXCLUDED.make,
                model = EXCLUDED.model,
                year = EXCLUDED.year,
                title = EXCLUDED.title,
                status = CASE
                    WHEN listings.status IN ('sold', 'unsold', 'delisted')
                         AND EXCLUDED.status IN ('active', 'draft')
                    THEN listings.status
                    ELSE EXCLUDED.status
                END,
                sale_date = EXCLUDED.sale_date,
                scraped_at = EXCLUDED.scraped_at,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(listing.source.key())
        .bind(&listing.source_id)
        .bind(&listing.source_url)
        .bind(&listing.make)
        .bind(&listing.model)
        .bind(listing.year)
        .bind(&listing.title)
        .bind(listing.status.as_str())
        .bind(listing.sale_date)
        .bind(listing.scraped_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    async fn upsert_pricing(&self, id: i64, listing: &CanonicalListing) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_pricing
                (listing_id, hammer_price_usd, current_bid_usd, final_price_usd,
                 bid_count, currency)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (listing_id) DO UPDATE SET
                hammer_price_usd = EXCLUDED.hammer_price_usd,
                current_bid_usd = EXCLUDED.current_bid_usd,
                final_price_usd = EXCLUDED.final_price_usd,
                bid_count = EXCLUDED.bid_count,
                currency = EXCLUDED.currency
            "#,
        )
        .bind(id)
        .bind(listing.hammer_price_usd)
        .bind(listing.current_bid_usd)
        .bind(listing.final_price_usd)
        .bind(listing.bid_count)
        .bind(&listing.currency)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_specs(&self, id: i64, listing: &CanonicalListing) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_specs (listing_id, vin, mileage, mileage_unit)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (listing_id) DO UPDATE SET
                vin = EXCLUDED.vin,
                mileage = EXCLUDED.mileage,
                mileage_unit = EXCLUDED.mileage_unit
            "#,
        )
        .bind(id)
        .bind(&listing.vin)
        .bind(listing.mileage)
        .bind(&listing.mileage_unit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_auction_info(
        &self,
        id: i64,
        listing: &CanonicalListing,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_auction_info (listing_id, auction_house, status, sale_date)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (listing_id) DO UPDATE SET
                auction_house = EXCLUDED.auction_house,
                status = EXCLUDED.status,
                sale_date = EXCLUDED.sale_date
            "#,
        )
        .bind(id)
        .bind(&listing.auction_house)
        .bind(listing.status.as_str())
        .bind(listing.sale_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_location(&self, id: i64, listing: &CanonicalListing) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_location (listing_id, city, region, country)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (listing_id) DO UPDATE SET
                city = EXCLUDED.city,
                region = EXCLUDED.region,
                country = EXCLUDED.country
            "#,
        )
        .bind(id)
        .bind(&listing.city)
        .bind(&listing.region)
        .bind(&listing.country)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_provenance(
        &self,
        id: i64,
        listing: &CanonicalListing,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_provenance (listing_id, source, source_url, scraped_at, raw)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (listing_id) DO UPDATE SET
                source = EXCLUDED.source,
                source_url = EXCLUDED.source_url,
                scraped_at = EXCLUDED.scraped_at,
                raw = EXCLUDED.raw
            "#,
        )
        .bind(id)
        .bind(listing.source.key())
        .bind(&listing.source_url)
        .bind(listing.scraped_at)
        .bind(&listing.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_photos(&self, id: i64, listing: &CanonicalListing) -> Result<(), StoreError> {
        for (position, url) in listing.image_urls.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO listing_photos (listing_id, url, position)
                VALUES ($1, $2, $3)
                ON CONFLICT (listing_id, url) DO UPDATE SET position = EXCLUDED.position
                "#,
            )
            .bind(id)
            .bind(url)
            .bind(position as i32)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn upsert_price_history(
        &self,
        id: i64,
        listing: &CanonicalListing,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_price_history (listing_id, bucket, price_usd)
            VALUES ($1, $2, $3)
            ON CONFLICT (listing_id, bucket) DO UPDATE SET price_usd = EXCLUDED.price_usd
            "#,
        )
        .bind(id)
        .bind(price_history_bucket(listing.scraped_at))
        .bind(observed_price(listing))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PostgresListingStore {
    async fn upsert(
        &self,
        listing: &CanonicalListing,
        dry_run: bool,
    ) -> Result<UpsertOutcome, StoreError> {
        if dry_run {
            return Ok(UpsertOutcome::default());
        }

        let existing = self.find_existing(listing).await?;
        let (id, inserted) = match existing {
            Some((id, current_status)) => {
                self.update_row(id, listing, current_status.advance(listing.status))
                    .await?;
                (id, false)
            }
            None => (self.insert_row(listing).await?, true),
        };
        debug!(source = %listing.source, source_id = %listing.source_id, id, inserted, "primary row written");

        // Child writes are best-effort: one failing relation must not take
        // down the others or the record.
        let mut warnings = Vec::new();
        if let Err(err) = self.upsert_pricing(id, listing).await {
            warnings.push(format!("pricing: {err}"));
        }
        if let Err(err) = self.upsert_specs(id, listing).await {
            warnings.push(format!("specs: {err}"));
        }
        if let Err(err) = self.upsert_auction_info(id, listing).await {
            warnings.push(format!("auction_info: {err}"));
        }
        if let Err(err) = self.upsert_location(id, listing).await {
            warnings.push(format!("location: {err}"));
        }
        if let Err(err) = self.upsert_provenance(id, listing).await {
            warnings.push(format!("provenance: {err}"));
        }
        if let Err(err) = self.upsert_photos(id, listing).await {
            warnings.push(format!("photos: {err}"));
        }
        if let Err(err) = self.upsert_price_history(id, listing).await {
            warnings.push(format!("price_history: {err}"));
        }

        Ok(UpsertOutcome {
            inserted: u32::from(inserted),
            updated: u32::from(!inserted),
            warnings,
        })
    }
}

#[derive(Debug)]
struct MemoryRow {
    id: i64,
    listing: CanonicalListing,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: HashMap<(Source, String), MemoryRow>,
    price_history: HashMap<(i64, DateTime<Utc>), Option<i64>>,
}

/// In-memory implementation of the upsert contract, used by tests, dry-run
/// wiring and offline runs. Mirrors the Postgres lookup order: identity key
/// first, then source-url drift.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: Mutex<MemoryState>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("store poisoned").rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, source: Source, source_id: &str) -> Option<CanonicalListing> {
        let state = self.state.lock().expect("store poisoned");
        state
            .rows
            .get(&(source, source_id.to_string()))
            .map(|row| row.listing.clone())
    }

    pub fn price_history_len(&self) -> usize {
        self.state.lock().expect("store poisoned").price_history.len()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn upsert(
        &self,
        listing: &CanonicalListing,
        dry_run: bool,
    ) -> Result<UpsertOutcome, StoreError> {
        if dry_run {
            return Ok(UpsertOutcome::default());
        }

        let mut state = self.state.lock().expect("store poisoned");
        let key = (listing.source, listing.source_id.clone());

        let (id, inserted) = if let Some(row) = state.rows.get_mut(&key) {
            let merged_status = row.listing.status.advance(listing.status);
            row.listing = listing.clone();
            row.listing.status = merged_status;
            (row.id, false)
        } else if let Some(drifted_key) = state
            .rows
            .iter()
            .find(|(_, row)| row.listing.source_url == listing.source_url)
            .map(|(key, _)| key.clone())
        {
            let row = state.rows.remove(&drifted_key).expect("key just found");
            let merged_status = row.listing.status.advance(listing.status);
            let mut replacement = listing.clone();
            replacement.status = merged_status;
            let id = row.id;
            state.rows.insert(key, MemoryRow { id, listing: replacement });
            (id, false)
        } else {
            state.next_id += 1;
            let id = state.next_id;
            state.rows.insert(
                key,
                MemoryRow {
                    id,
                    listing: listing.clone(),
                },
            );
            (id, true)
        };

        state
            .price_history
            .insert((id, price_history_bucket(listing.scraped_at)), observed_price(listing));

        Ok(UpsertOutcome {
            inserted: u32::from(inserted),
            updated: u32::from(!inserted),
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

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
            bid_count: Some(42),
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
            scraped_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 17, 45).single().unwrap(),
        }
    }

    #[test]
    fn bucket_truncates_to_the_hour() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 59, 59).single().unwrap();
        assert_eq!(
            price_history_bucket(ts),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn observed_price_prefers_final_over_bid() {
        let mut l = listing();
        assert_eq!(observed_price(&l), Some(156_000));
        l.final_price_usd = Some(160_000);
        assert_eq!(observed_price(&l), Some(160_000));
    }

    #[tokio::test]
    async fn upserting_twice_inserts_then_updates() {
        let store = MemoryListingStore::new();
        let l = listing();

        let first = store.upsert(&l, false).await.unwrap();
        assert_eq!((first.inserted, first.updated), (1, 0));

        let second = store.upsert(&l, false).await.unwrap();
        assert_eq!((second.inserted, second.updated), (0, 1));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing_and_reports_zeroes() {
        let store = MemoryListingStore::new();
        let outcome = store.upsert(&listing(), true).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::default());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn identifier_drift_updates_the_row_found_by_url() {
        let store = MemoryListingStore::new();
        store.upsert(&listing(), false).await.unwrap();

        let mut drifted = listing();
        drifted.source_id = "bat-9981".into();
        let outcome = store.upsert(&drifted, false).await.unwrap();
        assert_eq!((outcome.inserted, outcome.updated), (0, 1));
        assert_eq!(store.len(), 1);
        assert!(store.get(Source::BringATrailer, "bat-9981").is_some());
        assert!(store.get(Source::BringATrailer, "123").is_none());
    }

    #[tokio::test]
    async fn terminal_status_survives_a_stale_active_record() {
        let store = MemoryListingStore::new();
        store.upsert(&listing(), false).await.unwrap();

        let mut stale = listing();
        stale.status = ListingStatus::Active;
        store.upsert(&stale, false).await.unwrap();

        let row = store.get(Source::BringATrailer, "123").unwrap();
        assert_eq!(row.status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn same_hour_upserts_share_one_price_history_point() {
        let store = MemoryListingStore::new();
        let mut l = listing();
        store.upsert(&l, false).await.unwrap();

        l.scraped_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 48, 2).single().unwrap();
        l.current_bid_usd = Some(158_000);
        store.upsert(&l, false).await.unwrap();
        assert_eq!(store.price_history_len(), 1);

        l.scraped_at = Utc.with_ymd_and_hms(2026, 3, 1, 13, 1, 0).single().unwrap();
        store.upsert(&l, false).await.unwrap();
        assert_eq!(store.price_history_len(), 2);
    }
}
