//! Integrity enforcement shared by every quantity-mutating path.
//!
//! Three independent layers protect stock quantities, each catching what the
//! others might miss:
//!
//! 1. **Pre-write validation** (this module + the engines): recompute
//!    availability, reject with an [`AvailabilityBreakdown`] the operator
//!    can act on.
//! 2. **Storage constraints** (behind the store traits): non-negative
//!    checks on every quantity column, unique keys. They fire even when the
//!    validation layer is bypassed and surface as defects.
//! 3. **Row locking** (transactions): exclusive locks in deterministic
//!    order, re-validation after acquisition, atomic deltas.
//!
//! Lock timeouts are transient; engines retry them internally a small
//! bounded number of times with exponential backoff before surfacing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::WarehouseStock;

/// Decomposed availability figures attached to every insufficient-stock
/// rejection.
///
/// Operators need the explanation of a shortfall, not just a boolean, so
/// each contributing quantity is carried separately and [`std::fmt::Display`]
/// renders the full arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityBreakdown {
    /// Units physically present at the scope: the denormalized on-hand row
    /// for a storefront, total intake for a warehouse.
    pub on_hand: i64,
    /// Signed contribution of completed adjustments (already folded into
    /// `on_hand` at storefronts, so zero there).
    pub adjustments: i64,
    /// Units deducted by dispatched, non-cancelled transfers.
    pub transferred_out: u64,
    /// Units held by other sessions' active reservations.
    pub reserved: u64,
    /// Units the failing request asked for.
    pub requested: u64,
    /// The figure the decision was made on:
    /// `on_hand + adjustments - transferred_out - reserved`.
    pub available: i64,
}

impl AvailabilityBreakdown {
    /// Breakdown for a storefront scope, where `on_hand` is the
    /// denormalized row already net of sales and adjustments.
    pub fn storefront(on_hand: u64, reserved: u64, requested: u64) -> Self {
        let on_hand_signed = i64::try_from(on_hand).unwrap_or(i64::MAX);
        let reserved_signed = i64::try_from(reserved).unwrap_or(i64::MAX);
        Self {
            on_hand: on_hand_signed,
            adjustments: 0,
            transferred_out: 0,
            reserved,
            requested,
            available: on_hand_signed - reserved_signed,
        }
    }

    /// Breakdown for a warehouse scope, recomputed from the batch-derived
    /// view plus the reserved share.
    pub fn warehouse(stock: &WarehouseStock, reserved: u64, requested: u64) -> Self {
        let reserved_signed = i64::try_from(reserved).unwrap_or(i64::MAX);
        Self {
            on_hand: i64::try_from(stock.intake()).unwrap_or(i64::MAX),
            adjustments: stock.adjusted(),
            transferred_out: stock.transferred_out(),
            reserved,
            requested,
            available: stock.available() - reserved_signed,
        }
    }

    /// Breakdown for transfer dispatch, which allocates from batches only.
    /// Positive warehouse-scope corrections are left out of `adjustments`
    /// and `available` so the figures match what allocation can actually
    /// take; negative ones still subtract.
    pub fn dispatch(stock: &WarehouseStock, requested: u64) -> Self {
        let batch_adjusted: i64 = stock.batches.iter().map(|b| b.adjusted).sum();
        Self {
            on_hand: i64::try_from(stock.intake()).unwrap_or(i64::MAX),
            adjustments: batch_adjusted + stock.loose_adjustments.min(0),
            transferred_out: stock.transferred_out(),
            reserved: 0,
            requested,
            available: stock.dispatchable(),
        }
    }

    /// Breakdown across every warehouse holding a product, used when a
    /// reservation has no direct storefront linkage and draws from the
    /// combined pool.
    pub fn warehouse_pool(pool: &[WarehouseStock], reserved: u64, requested: u64) -> Self {
        let reserved_signed = i64::try_from(reserved).unwrap_or(i64::MAX);
        let intake: u64 = pool.iter().map(WarehouseStock::intake).sum();
        Self {
            on_hand: i64::try_from(intake).unwrap_or(i64::MAX),
            adjustments: pool.iter().map(WarehouseStock::adjusted).sum(),
            transferred_out: pool.iter().map(WarehouseStock::transferred_out).sum(),
            reserved,
            requested,
            available: pool.iter().map(WarehouseStock::available).sum::<i64>() - reserved_signed,
        }
    }

    /// Whether the requested units fit in the available figure.
    pub fn is_sufficient(&self) -> bool {
        i64::try_from(self.requested).map_or(false, |req| req <= self.available)
    }
}

impl std::fmt::Display for AvailabilityBreakdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requested {} but only {} available (on-hand {}, adjustments {}, transferred out {}, reserved {})",
            self.requested,
            self.available,
            self.on_hand,
            self.adjustments,
            self.transferred_out,
            self.reserved
        )
    }
}

/// Retry behavior for transient lock-timeout failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), exponential with
    /// jitter to avoid thundering-herd retries of concurrent callers.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = self.backoff_multiplier.powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(0));
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = rand::rng().random_range(0.75..1.25);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Lock and retry discipline shared by every engine.
#[derive(Debug, Clone)]
pub struct IntegrityConfig {
    /// How long a transaction waits on any single row lock.
    pub lock_timeout: Duration,
    /// Bounded internal retry of lock timeouts.
    pub retry: RetryConfig,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchCosts, StockBatch};
    use crate::store::BatchStock;
    use crate::types::{BatchId, Money, ProductId, WarehouseId};
    use chrono::Utc;

    #[test]
    fn storefront_breakdown_subtracts_other_sessions_holds() {
        let b = AvailabilityBreakdown::storefront(10, 6, 6);
        assert_eq!(b.available, 4);
        assert!(!b.is_sufficient());
        let msg = b.to_string();
        assert!(msg.contains("requested 6"));
        assert!(msg.contains("only 4 available"));
        assert!(msg.contains("on-hand 10"));
        assert!(msg.contains("reserved 6"));
    }

    #[test]
    fn storefront_breakdown_sufficient_when_it_fits() {
        let b = AvailabilityBreakdown::storefront(10, 4, 6);
        assert_eq!(b.available, 6);
        assert!(b.is_sufficient());
    }

    #[test]
    fn warehouse_breakdown_recomputes_from_batches() {
        let stock = WarehouseStock {
            warehouse: WarehouseId::try_new("wh-1").unwrap(),
            product: ProductId::try_new("p-1").unwrap(),
            batches: vec![BatchStock {
                batch: StockBatch {
                    id: BatchId::generate(),
                    product: ProductId::try_new("p-1").unwrap(),
                    warehouse: WarehouseId::try_new("wh-1").unwrap(),
                    quantity: 30,
                    costs: BatchCosts::fixed_tax(Money::zero(), Money::zero(), Money::zero()),
                    supplier: None,
                    arrival_date: Utc::now(),
                    expiry_date: None,
                },
                adjusted: 0,
                allocated_out: 30,
            }],
            loose_adjustments: 0,
        };
        let b = AvailabilityBreakdown::warehouse(&stock, 0, 1);
        assert_eq!(b.available, 0);
        assert_eq!(b.transferred_out, 30);
        assert!(!b.is_sufficient());
    }

    #[test]
    fn dispatch_breakdown_counts_batch_backed_stock_only() {
        let stock = |loose| WarehouseStock {
            warehouse: WarehouseId::try_new("wh-1").unwrap(),
            product: ProductId::try_new("p-1").unwrap(),
            batches: vec![BatchStock {
                batch: StockBatch {
                    id: BatchId::generate(),
                    product: ProductId::try_new("p-1").unwrap(),
                    warehouse: WarehouseId::try_new("wh-1").unwrap(),
                    quantity: 5,
                    costs: BatchCosts::fixed_tax(Money::zero(), Money::zero(), Money::zero()),
                    supplier: None,
                    arrival_date: Utc::now(),
                    expiry_date: None,
                },
                adjusted: 0,
                allocated_out: 0,
            }],
            loose_adjustments: loose,
        };

        // A +10 warehouse-scope correction has no batch to draw from.
        let surplus = stock(10);
        assert_eq!(surplus.available(), 15);
        let b = AvailabilityBreakdown::dispatch(&surplus, 10);
        assert_eq!(b.available, 5);
        assert_eq!(b.adjustments, 0);
        assert!(!b.is_sufficient());

        // A deficit not yet attributed to a batch still subtracts.
        let deficit = stock(-2);
        let b = AvailabilityBreakdown::dispatch(&deficit, 4);
        assert_eq!(b.available, 3);
        assert_eq!(b.adjustments, -2);
        assert!(!b.is_sufficient());
        assert!(AvailabilityBreakdown::dispatch(&deficit, 3).is_sufficient());
    }

    #[test]
    fn retry_delay_grows_and_stays_capped() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };
        // Jitter is +/-25%, so check generous envelopes.
        let first = config.delay_for(1);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        let fifth = config.delay_for(5);
        assert!(fifth <= Duration::from_millis(625));
    }
}
