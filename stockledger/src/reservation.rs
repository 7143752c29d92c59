//! Reservation manager: short-lived holds against sellable stock.
//!
//! A reservation never reduces physical quantity; it only reduces the
//! *sellable* quantity other concurrent carts see. Holds expire passively:
//! every read compares `expires_at` against the clock, and
//! [`ReservationManager::sweep_expired`] merely persists what lazy
//! evaluation already concluded. Only sales still in `Draft` status hold
//! reservations; the moment a sale leaves `Draft`, its holds are released
//! as part of the commit sequence in [`crate::sale`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{InventoryError, InventoryResult};
use crate::integrity::{AvailabilityBreakdown, IntegrityConfig};
use crate::store::{InventoryStore, InventoryTransaction, RowKey, StagedOp, WarehouseStock};
use crate::types::{
    ProductId, Quantity, ReservationId, SaleId, SessionId, StorefrontId, WarehouseId,
};

/// Lifecycle of one hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Counting against sellable stock.
    Active,
    /// Released by sale completion, cancellation, or explicit release.
    Released,
    /// TTL lapsed before the sale left draft.
    Expired,
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("ACTIVE"),
            Self::Released => f.write_str("RELEASED"),
            Self::Expired => f.write_str("EXPIRED"),
        }
    }
}

/// A temporary hold of units against a product for one cart/session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReservation {
    /// Unique reservation identifier.
    pub id: ReservationId,
    /// The cart/session holding the units.
    pub session: SessionId,
    /// The draft sale this hold belongs to, when known.
    pub sale: Option<SaleId>,
    /// The product held.
    pub product: ProductId,
    /// Direct storefront linkage. `None` means the hold draws from the
    /// warehouse pool and is distributed proportionally for reporting.
    pub storefront: Option<StorefrontId>,
    /// Units held.
    pub quantity: u64,
    /// Current status. Statuses flip, rows are kept (released, not
    /// deleted, by default).
    pub status: ReservationStatus,
    /// When the hold was created or last re-validated.
    pub created_at: DateTime<Utc>,
    /// When the hold lapses.
    pub expires_at: DateTime<Utc>,
}

impl StockReservation {
    /// Whether this hold counts against sellable stock at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at > now
    }

    /// Whether this hold is still marked active but its TTL has lapsed.
    pub fn lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at <= now
    }
}

/// Defaults for hold lifetimes.
#[derive(Debug, Clone)]
pub struct ReservationConfig {
    /// TTL applied when the caller does not supply one.
    pub default_ttl: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// Input for placing or updating a hold.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// The cart/session requesting the hold.
    pub session: SessionId,
    /// The draft sale the hold belongs to, when known.
    pub sale: Option<SaleId>,
    /// The product to hold.
    pub product: ProductId,
    /// Direct storefront linkage, if the cart is tied to one.
    pub storefront: Option<StorefrontId>,
    /// Units to hold. Replaces any existing hold the session has for the
    /// same product/storefront (line-item updates re-reserve).
    pub quantity: Quantity,
    /// Hold lifetime; the configured default when `None`.
    pub ttl: Option<Duration>,
}

/// Scope for availability questions: one storefront's sellable stock or
/// one warehouse's physical pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockScope {
    /// Sellable stock at one storefront.
    Storefront(StorefrontId),
    /// Physical pool at one warehouse.
    Warehouse(WarehouseId),
}

/// Answer to a pre-flight availability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityProbe {
    /// Units a new request could take right now.
    pub available_quantity: i64,
    /// Whether the probed quantity fits.
    pub is_available: bool,
    /// The decomposition explaining the figure.
    pub breakdown: AvailabilityBreakdown,
}

/// Engine owning holds and availability math.
#[derive(Debug, Clone)]
pub struct ReservationManager<S> {
    store: Arc<S>,
    config: IntegrityConfig,
    reservations: ReservationConfig,
}

impl<S: InventoryStore> ReservationManager<S> {
    /// Creates a reservation manager over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: IntegrityConfig::default(),
            reservations: ReservationConfig::default(),
        }
    }

    /// Overrides the lock/retry discipline.
    #[must_use]
    pub fn with_config(mut self, config: IntegrityConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the reservation defaults.
    #[must_use]
    pub fn with_reservation_config(mut self, reservations: ReservationConfig) -> Self {
        self.reservations = reservations;
        self
    }

    /// Places (or replaces) a hold for a session.
    ///
    /// Validates availability under the row lock and rejects with
    /// [`InventoryError::InsufficientStock`] carrying the full breakdown if
    /// the units do not fit.
    pub async fn reserve(&self, request: ReserveRequest) -> InventoryResult<StockReservation> {
        let mut attempt = 1;
        loop {
            match self.try_reserve(&request).await {
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_reserve(&self, request: &ReserveRequest) -> InventoryResult<StockReservation> {
        let now = Utc::now();
        let ttl = request.ttl.unwrap_or(self.reservations.default_ttl);
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));

        let keys = match &request.storefront {
            Some(sf) => vec![RowKey::Storefront(sf.clone(), request.product.clone())],
            None => vec![RowKey::Product(request.product.clone())],
        };
        let mut tx = self.store.begin(keys, self.config.lock_timeout).await?;

        let holds = tx.reservations_for_product(&request.product).await?;
        // The session's own hold for this line is being replaced, so it is
        // excluded from the reserved figure.
        let reserved_by_others: u64 = holds
            .iter()
            .filter(|r| {
                r.is_active_at(now)
                    && r.session != request.session
                    && r.storefront == request.storefront
            })
            .map(|r| r.quantity)
            .sum();

        let breakdown = match &request.storefront {
            Some(sf) => {
                let on_hand = tx.storefront_quantity(sf, &request.product).await?;
                AvailabilityBreakdown::storefront(
                    on_hand,
                    reserved_by_others,
                    request.quantity.get(),
                )
            }
            None => {
                let pool = tx.product_stock(&request.product).await?;
                AvailabilityBreakdown::warehouse_pool(
                    &pool,
                    reserved_by_others,
                    request.quantity.get(),
                )
            }
        };
        if !breakdown.is_sufficient() {
            tracing::debug!(
                product = %request.product,
                session = %request.session,
                %breakdown,
                "reservation rejected"
            );
            return Err(InventoryError::InsufficientStock { breakdown });
        }

        let existing = holds.iter().find(|r| {
            r.session == request.session
                && r.storefront == request.storefront
                && r.is_active_at(now)
        });
        let reservation = StockReservation {
            id: existing.map_or_else(ReservationId::generate, |r| r.id.clone()),
            session: request.session.clone(),
            sale: request.sale.clone(),
            product: request.product.clone(),
            storefront: request.storefront.clone(),
            quantity: request.quantity.get(),
            status: ReservationStatus::Active,
            created_at: now,
            expires_at,
        };
        tx.stage(StagedOp::UpsertReservation(reservation.clone()));
        tx.commit().await?;
        tracing::debug!(reservation = %reservation.id, session = %reservation.session, quantity = reservation.quantity, "hold placed");
        Ok(reservation)
    }

    /// Releases every active hold of a session. Idempotent: holds already
    /// released or expired are left untouched, and releasing a session with
    /// no holds is a no-op. Returns how many holds were released.
    pub async fn release(&self, session: &SessionId) -> InventoryResult<usize> {
        let now = Utc::now();
        let holds = self.store.reservations_for_session(session).await?;
        let mut tx = self.store.begin(Vec::new(), self.config.lock_timeout).await?;
        let mut released = 0;
        for hold in holds {
            if hold.status != ReservationStatus::Active {
                continue;
            }
            let status = if hold.lapsed_at(now) {
                ReservationStatus::Expired
            } else {
                released += 1;
                ReservationStatus::Released
            };
            tx.stage(StagedOp::UpsertReservation(StockReservation {
                status,
                ..hold
            }));
        }
        tx.commit().await?;
        if released > 0 {
            tracing::debug!(session = %session, released, "holds released");
        }
        Ok(released)
    }

    /// Pushes the expiry of a session's live holds forward by `ttl`.
    ///
    /// Lapsed holds are not revived (reviving without re-validating
    /// availability could oversell); they are swept to `Expired` instead
    /// and the caller re-reserves. Returns how many holds were extended.
    pub async fn extend(&self, session: &SessionId, ttl: Duration) -> InventoryResult<usize> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let holds = self.store.reservations_for_session(session).await?;
        let mut tx = self.store.begin(Vec::new(), self.config.lock_timeout).await?;
        let mut extended = 0;
        for hold in holds {
            if hold.is_active_at(now) {
                extended += 1;
                tx.stage(StagedOp::UpsertReservation(StockReservation {
                    expires_at,
                    ..hold
                }));
            } else if hold.lapsed_at(now) {
                tx.stage(StagedOp::UpsertReservation(StockReservation {
                    status: ReservationStatus::Expired,
                    ..hold
                }));
            }
        }
        tx.commit().await?;
        Ok(extended)
    }

    /// Units currently held against a product by active reservations.
    pub async fn reserved_quantity(&self, product: &ProductId) -> InventoryResult<u64> {
        let now = Utc::now();
        let holds = self.store.reservations_for_product(product).await?;
        Ok(holds
            .iter()
            .filter(|r| r.is_active_at(now))
            .map(|r| r.quantity)
            .sum())
    }

    /// Pre-flight availability probe for UI checks before reserving.
    ///
    /// Lock-free: reads committed state and may be slightly stale; the
    /// write-time re-validation under lock catches staleness in the unsafe
    /// direction.
    pub async fn get_availability(
        &self,
        scope: &StockScope,
        product: &ProductId,
        requested: Quantity,
    ) -> InventoryResult<AvailabilityProbe> {
        let now = Utc::now();
        let holds = self.store.reservations_for_product(product).await?;
        let breakdown = match scope {
            StockScope::Storefront(sf) => {
                let on_hand = self.store.storefront_quantity(sf, product).await?;
                let reserved: u64 = holds
                    .iter()
                    .filter(|r| r.is_active_at(now) && r.storefront.as_ref() == Some(sf))
                    .map(|r| r.quantity)
                    .sum();
                AvailabilityBreakdown::storefront(on_hand, reserved, requested.get())
            }
            StockScope::Warehouse(wh) => {
                let all = self.store.product_stock(product).await?;
                let unlinked: u64 = holds
                    .iter()
                    .filter(|r| r.is_active_at(now) && r.storefront.is_none())
                    .map(|r| r.quantity)
                    .sum();
                let stock = all
                    .iter()
                    .find(|s| &s.warehouse == wh)
                    .cloned()
                    .unwrap_or_else(|| WarehouseStock {
                        warehouse: wh.clone(),
                        product: product.clone(),
                        batches: Vec::new(),
                        loose_adjustments: 0,
                    });
                let reserved = proportional_share(&stock, &all, unlinked);
                AvailabilityBreakdown::warehouse(&stock, reserved, requested.get())
            }
        };
        Ok(AvailabilityProbe {
            available_quantity: breakdown.available,
            is_available: breakdown.is_sufficient(),
            breakdown,
        })
    }

    /// Persists the `Expired` status on holds whose TTL lapsed. Idempotent;
    /// reads already ignore lapsed holds, so running this is a
    /// cache-freshness concern, not a correctness one.
    pub async fn sweep_expired(&self) -> InventoryResult<usize> {
        Ok(self.store.sweep_expired_reservations(Utc::now()).await?)
    }
}

/// Share of the storefront-unlinked held units attributed to one warehouse,
/// by stock-share ratio.
///
/// This is an approximation carried over from the source system, not a
/// fairness guarantee: with no sale-to-warehouse relation in the data model
/// there is nothing better to key on. Replace with direct linkage if that
/// relation ever exists.
fn proportional_share(stock: &WarehouseStock, all: &[WarehouseStock], unlinked_total: u64) -> u64 {
    let pool: i64 = all.iter().map(WarehouseStock::available).sum();
    if pool <= 0 {
        return 0;
    }
    let own = stock.available().max(0);
    let share = (i128::from(unlinked_total) * i128::from(own)) / i128::from(pool);
    u64::try_from(share).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchCosts, StockBatch};
    use crate::store::BatchStock;
    use crate::types::{BatchId, Money};

    fn reservation(status: ReservationStatus, expires_in_secs: i64) -> StockReservation {
        StockReservation {
            id: ReservationId::generate(),
            session: SessionId::try_new("sess-1").unwrap(),
            sale: None,
            product: ProductId::try_new("p-1").unwrap(),
            storefront: None,
            quantity: 4,
            status,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        }
    }

    #[test]
    fn active_unexpired_hold_counts() {
        let r = reservation(ReservationStatus::Active, 60);
        assert!(r.is_active_at(Utc::now()));
        assert!(!r.lapsed_at(Utc::now()));
    }

    #[test]
    fn active_hold_past_ttl_is_lapsed_not_active() {
        let r = reservation(ReservationStatus::Active, -1);
        assert!(!r.is_active_at(Utc::now()));
        assert!(r.lapsed_at(Utc::now()));
    }

    #[test]
    fn released_hold_never_counts() {
        let r = reservation(ReservationStatus::Released, 60);
        assert!(!r.is_active_at(Utc::now()));
        assert!(!r.lapsed_at(Utc::now()));
    }

    fn wh_stock(warehouse: &str, quantity: u64) -> WarehouseStock {
        WarehouseStock {
            warehouse: WarehouseId::try_new(warehouse).unwrap(),
            product: ProductId::try_new("p-1").unwrap(),
            batches: vec![BatchStock {
                batch: StockBatch {
                    id: BatchId::generate(),
                    product: ProductId::try_new("p-1").unwrap(),
                    warehouse: WarehouseId::try_new(warehouse).unwrap(),
                    quantity,
                    costs: BatchCosts::fixed_tax(Money::zero(), Money::zero(), Money::zero()),
                    supplier: None,
                    arrival_date: Utc::now(),
                    expiry_date: None,
                },
                adjusted: 0,
                allocated_out: 0,
            }],
            loose_adjustments: 0,
        }
    }

    #[test]
    fn proportional_share_follows_stock_ratio() {
        let a = wh_stock("wh-a", 75);
        let b = wh_stock("wh-b", 25);
        let all = vec![a.clone(), b.clone()];
        assert_eq!(proportional_share(&a, &all, 20), 15);
        assert_eq!(proportional_share(&b, &all, 20), 5);
    }

    #[test]
    fn proportional_share_with_empty_pool_is_zero() {
        let a = wh_stock("wh-a", 0);
        let all = vec![a.clone()];
        assert_eq!(proportional_share(&a, &all, 20), 0);
    }
}
