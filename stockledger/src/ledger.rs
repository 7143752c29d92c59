//! The derived movement ledger.
//!
//! Movement history is never persisted as its own table. Every query
//! derives it on demand from the committed source records (sales,
//! transfers, adjustments), so the ledger can never disagree with the
//! stock it explains. Filtering, pagination and aggregation are pushed
//! down into the storage query layer; the full movement set is never
//! materialized for a caller. Summary figures are cached per filter for a
//! short TTL since operators poll them far more often than the sources
//! change.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::errors::InventoryResult;
use crate::store::InventoryStore;
use crate::types::{
    AdjustmentId, Money, ProductId, SaleId, StorefrontId, TransferId, WarehouseId,
};

/// Kind of stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementType {
    /// Storefront deduction from a committed sale.
    Sale,
    /// Warehouse-to-storefront transfer.
    Transfer,
    /// Manual count correction.
    Adjustment,
    /// Loss write-off.
    Shrinkage,
}

impl std::fmt::Display for MovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sale => f.write_str("SALE"),
            Self::Transfer => f.write_str("TRANSFER"),
            Self::Adjustment => f.write_str("ADJUSTMENT"),
            Self::Shrinkage => f.write_str("SHRINKAGE"),
        }
    }
}

/// Which way the stock moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementDirection {
    /// Units entered the scope (positive adjustment).
    In,
    /// Units left the scope (sale, shrinkage, in-transit transfer).
    Out,
    /// Units moved between two tracked locations (completed transfer);
    /// nets to zero system-wide.
    Both,
}

/// Deep link back to the source record a movement row was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementRef {
    /// A committed sale.
    Sale(SaleId),
    /// A transfer request.
    Transfer(TransferId),
    /// An adjustment record.
    Adjustment(AdjustmentId),
}

impl std::fmt::Display for MovementRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sale(id) => write!(f, "sale/{id}"),
            Self::Transfer(id) => write!(f, "transfer/{id}"),
            Self::Adjustment(id) => write!(f, "adjustment/{id}"),
        }
    }
}

/// One row of the derived movement view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRecord {
    /// The source record this row was derived from.
    pub reference: MovementRef,
    /// Kind of movement.
    pub movement_type: MovementType,
    /// Which way the stock moved.
    pub direction: MovementDirection,
    /// The moved product.
    pub product: ProductId,
    /// Units moved (always the magnitude; `direction` carries the sign).
    pub quantity: u64,
    /// Per-unit valuation: sale price for sales, landed cost for
    /// transfers, recorded unit cost for adjustments, when known.
    pub unit_value: Option<Money>,
    /// Warehouse endpoint, for warehouse-side movements.
    pub warehouse: Option<WarehouseId>,
    /// Storefront endpoint, for storefront-side movements.
    pub storefront: Option<StorefrontId>,
    /// When the movement was committed.
    pub occurred_at: DateTime<Utc>,
}

impl MovementRecord {
    /// Net unit contribution: positive in, negative out, zero for a
    /// completed transfer (what one location lost the other gained).
    pub fn signed_quantity(&self) -> i64 {
        let q = i64::try_from(self.quantity).unwrap_or(i64::MAX);
        match self.direction {
            MovementDirection::In => q,
            MovementDirection::Out => -q,
            MovementDirection::Both => 0,
        }
    }

    /// Net monetary contribution, when a unit value is known.
    pub fn signed_value(&self) -> Option<Decimal> {
        self.unit_value.map(|unit| {
            let value = unit.times(self.quantity);
            match self.direction {
                MovementDirection::In => value,
                MovementDirection::Out => -value,
                MovementDirection::Both => Decimal::ZERO,
            }
        })
    }
}

/// Filter over the derived movement view. An empty field means
/// "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MovementFilter {
    /// Inclusive lower bound on `occurred_at`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `occurred_at`.
    pub to: Option<DateTime<Utc>>,
    /// Restrict to one warehouse endpoint.
    pub warehouse: Option<WarehouseId>,
    /// Restrict to one storefront endpoint.
    pub storefront: Option<StorefrontId>,
    /// Restrict to these products (empty = all).
    pub products: Vec<ProductId>,
    /// Restrict to these movement kinds (empty = all).
    pub movement_types: Vec<MovementType>,
}

impl MovementFilter {
    /// Whether a derived row passes this filter. Shared by store
    /// implementations so every backend agrees on filter semantics.
    pub fn matches(&self, record: &MovementRecord) -> bool {
        if self.from.is_some_and(|from| record.occurred_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.occurred_at > to) {
            return false;
        }
        if let Some(warehouse) = &self.warehouse {
            if record.warehouse.as_ref() != Some(warehouse) {
                return false;
            }
        }
        if let Some(storefront) = &self.storefront {
            if record.storefront.as_ref() != Some(storefront) {
                return false;
            }
        }
        if !self.products.is_empty() && !self.products.contains(&record.product) {
            return false;
        }
        if !self.movement_types.is_empty()
            && !self.movement_types.contains(&record.movement_type)
        {
            return false;
        }
        true
    }

    fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Largest page a single query may return.
pub const MAX_PAGE_SIZE: usize = 200;

/// Page size used when the caller does not pick one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Offset/limit pagination request. The limit is clamped into
/// `1..=`[`MAX_PAGE_SIZE`] at construction so no query can ask the store
/// to materialize an unbounded page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Rows to skip.
    pub offset: usize,
    /// Rows per page, already clamped.
    pub limit: usize,
}

impl PageRequest {
    /// Builds a page request, clamping `limit` into `1..=`[`MAX_PAGE_SIZE`].
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One page of movements plus the companion count of the whole filtered
/// set, so a client can render page controls without a second query.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementPage {
    /// The rows of this page, most recent first.
    pub items: Vec<MovementRecord>,
    /// Total rows matching the filter, across all pages.
    pub total: usize,
    /// Offset this page started at.
    pub offset: usize,
    /// Limit this page was built with.
    pub limit: usize,
}

impl MovementPage {
    /// Whether another page exists past this one.
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

/// Folded totals for one aggregation bucket (a warehouse, a product, a
/// category or a time period).
///
/// Transfers relocate stock rather than create or consume it, so they are
/// counted in `transfers` instead of `units_in`/`units_out`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementTotals {
    /// Movements folded into this bucket.
    pub movements: u64,
    /// Units that entered (non-transfer inflows).
    pub units_in: u64,
    /// Units that left (non-transfer outflows).
    pub units_out: u64,
    /// Transfer movements touching this bucket.
    pub transfers: u64,
    /// Net unit change.
    pub net_units: i64,
}

impl MovementTotals {
    /// Folds one movement into the totals.
    pub fn absorb(&mut self, record: &MovementRecord) {
        self.movements += 1;
        if record.movement_type == MovementType::Transfer {
            self.transfers += 1;
        } else {
            match record.direction {
                MovementDirection::In => self.units_in += record.quantity,
                MovementDirection::Out => self.units_out += record.quantity,
                MovementDirection::Both => {}
            }
        }
        self.net_units += record.signed_quantity();
    }
}

/// Summary over an entire filtered movement set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementSummary {
    /// All movements in the set.
    pub total_movements: u64,
    /// Units that entered via non-transfer inflows.
    pub total_in: u64,
    /// Units that left via non-transfer outflows.
    pub total_out: u64,
    /// Adjustment and shrinkage records.
    pub total_adjustments: u64,
    /// Transfer records.
    pub total_transfers: u64,
    /// Net unit change across the set.
    pub net_quantity_change: i64,
    /// Net monetary change across the movements carrying a unit value.
    pub net_value_change: Decimal,
    /// Units written off as shrinkage.
    pub shrinkage_units: u64,
    /// Monetary value of the shrinkage write-offs, where costed.
    pub shrinkage_value: Decimal,
}

impl MovementSummary {
    /// Folds one movement into the summary.
    pub fn absorb(&mut self, record: &MovementRecord) {
        self.total_movements += 1;
        match record.movement_type {
            MovementType::Transfer => self.total_transfers += 1,
            MovementType::Adjustment | MovementType::Shrinkage => {
                self.total_adjustments += 1;
                match record.direction {
                    MovementDirection::In => self.total_in += record.quantity,
                    MovementDirection::Out => self.total_out += record.quantity,
                    MovementDirection::Both => {}
                }
            }
            MovementType::Sale => self.total_out += record.quantity,
        }
        if record.movement_type == MovementType::Shrinkage {
            self.shrinkage_units += record.quantity;
            if let Some(unit) = record.unit_value {
                self.shrinkage_value += unit.times(record.quantity);
            }
        }
        self.net_quantity_change += record.signed_quantity();
        if let Some(value) = record.signed_value() {
            self.net_value_change += value;
        }
    }
}

/// Calendar bucket for time-series aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeBucket {
    /// Calendar day.
    Day,
    /// ISO week (Monday start).
    Week,
    /// Calendar month.
    Month,
}

impl TimeBucket {
    /// The UTC start of the bucket containing `at`.
    pub fn start_of(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let start = match self {
            Self::Day => date,
            Self::Week => {
                let back = i64::from(date.weekday().num_days_from_monday());
                date - TimeDelta::days(back)
            }
            Self::Month => date.with_day(1).unwrap_or(date),
        };
        start.and_time(NaiveTime::MIN).and_utc()
    }
}

/// Totals for one time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodTotals {
    /// UTC start of the bucket.
    pub period_start: DateTime<Utc>,
    /// Folded totals for the bucket.
    pub totals: MovementTotals,
}

/// Tuning for the movement ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a computed summary stays fresh per filter.
    pub summary_cache_ttl: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            summary_cache_ttl: Duration::from_secs(60),
        }
    }
}

struct SummaryCache {
    entries: RwLock<HashMap<u64, (Instant, MovementSummary)>>,
}

impl SummaryCache {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: u64, ttl: Duration) -> Option<MovementSummary> {
        let entries = self.entries.read().expect("RwLock poisoned");
        entries
            .get(&key)
            .filter(|(at, _)| at.elapsed() < ttl)
            .map(|(_, summary)| summary.clone())
    }

    fn put(&self, key: u64, summary: MovementSummary) {
        let mut entries = self.entries.write().expect("RwLock poisoned");
        // Stale entries pile up only per distinct filter; evict lazily.
        entries.insert(key, (Instant::now(), summary));
    }
}

/// Read-side engine over the derived movement view.
pub struct MovementLedger<S> {
    store: Arc<S>,
    config: LedgerConfig,
    cache: SummaryCache,
}

impl<S: InventoryStore> MovementLedger<S> {
    /// Creates a ledger over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: LedgerConfig::default(),
            cache: SummaryCache::new(),
        }
    }

    /// Overrides the cache TTL.
    #[must_use]
    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// One page of movements, most recent first, with the companion total
    /// count. Never cached; listing must reflect the latest commits.
    pub async fn list(
        &self,
        filter: &MovementFilter,
        page: &PageRequest,
    ) -> InventoryResult<MovementPage> {
        Ok(self.store.list_movements(filter, page).await?)
    }

    /// Summary over the whole filtered set. Served from the per-filter
    /// cache when fresher than the configured TTL.
    pub async fn summary(&self, filter: &MovementFilter) -> InventoryResult<MovementSummary> {
        let key = filter.cache_key();
        if let Some(cached) = self.cache.get(key, self.config.summary_cache_ttl) {
            return Ok(cached);
        }
        let summary = self.store.summarize_movements(filter).await?;
        self.cache.put(key, summary.clone());
        Ok(summary)
    }

    /// Per-warehouse totals over the filtered set.
    pub async fn totals_by_warehouse(
        &self,
        filter: &MovementFilter,
    ) -> InventoryResult<HashMap<WarehouseId, MovementTotals>> {
        Ok(self.store.totals_by_warehouse(filter).await?)
    }

    /// Per-product totals over the filtered set.
    pub async fn totals_by_product(
        &self,
        filter: &MovementFilter,
    ) -> InventoryResult<HashMap<ProductId, MovementTotals>> {
        Ok(self.store.totals_by_product(filter).await?)
    }

    /// Per-category totals, resolving each product's category through the
    /// external catalog. Products the catalog does not know land under
    /// `"uncategorized"`.
    pub async fn totals_by_category(
        &self,
        filter: &MovementFilter,
        catalog: &dyn Catalog,
    ) -> InventoryResult<HashMap<String, MovementTotals>> {
        let by_product = self.store.totals_by_product(filter).await?;
        let mut by_category: HashMap<String, MovementTotals> = HashMap::new();
        for (product, totals) in by_product {
            let category = catalog
                .product(&product)
                .await?
                .and_then(|info| info.category)
                .unwrap_or_else(|| "uncategorized".to_owned());
            let entry = by_category.entry(category).or_default();
            entry.movements += totals.movements;
            entry.units_in += totals.units_in;
            entry.units_out += totals.units_out;
            entry.transfers += totals.transfers;
            entry.net_units += totals.net_units;
        }
        Ok(by_category)
    }

    /// Ordered per-period totals over the filtered set.
    pub async fn time_series(
        &self,
        filter: &MovementFilter,
        bucket: TimeBucket,
    ) -> InventoryResult<Vec<PeriodTotals>> {
        Ok(self.store.movement_time_series(filter, bucket).await?)
    }

    /// Average units sold per day over the filter's date range (the last
    /// 30 days when the filter leaves the range open).
    pub async fn sales_velocity(&self, filter: &MovementFilter) -> InventoryResult<Decimal> {
        let now = Utc::now();
        let mut bounded = filter.clone();
        let to = bounded.to.get_or_insert(now).to_owned();
        let from = bounded.from.get_or_insert(to - TimeDelta::days(30)).to_owned();
        bounded.movement_types = vec![MovementType::Sale];
        let summary = self.store.summarize_movements(&bounded).await?;
        let days = (to - from).num_days().max(1);
        Ok(Decimal::from(summary.total_out) / Decimal::from(days))
    }
}
