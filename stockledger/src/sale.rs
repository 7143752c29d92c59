//! Sale-stock interaction: the commit sequence that turns a draft cart's
//! holds into a physical deduction.
//!
//! The single most important invariant in the system is the coupling
//! between sale status and stock state: a `Draft` sale's stock is
//! *reserved*; any other status means the stock is already either committed
//! or fully returned. [`SaleStatus::holds_reservations`] is the one lookup
//! encoding that rule; every place that counts reserved stock goes through
//! it rather than re-deriving the mapping ad hoc.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{InventoryError, InventoryResult};
use crate::integrity::{AvailabilityBreakdown, IntegrityConfig};
use crate::reservation::{ReservationStatus, StockReservation};
use crate::store::{InventoryStore, InventoryTransaction, RowKey, StagedOp};
use crate::types::{Money, ProductId, Quantity, SaleId, SessionId, StorefrontId};

/// Lifecycle of a sale, owned by the external checkout service. The ledger
/// only cares about the stock side effect of each status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaleStatus {
    /// Cart being built; stock is held by reservations.
    Draft,
    /// Credit sale, no payment yet; stock committed.
    Pending,
    /// Partially paid; stock committed.
    Partial,
    /// Fully paid; stock committed.
    Completed,
    /// Abandoned before commit; holds released, no stock moved.
    Cancelled,
    /// Refunded after completion; any physical return is recorded as a
    /// correction adjustment by the caller.
    Refunded,
}

impl SaleStatus {
    /// The status-to-stock-state mapping: `Draft` is the only status whose
    /// stock is reserved rather than committed or returned.
    pub const fn holds_reservations(self) -> bool {
        matches!(self, Self::Draft)
    }
}

impl std::fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => f.write_str("DRAFT"),
            Self::Pending => f.write_str("PENDING"),
            Self::Partial => f.write_str("PARTIAL"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Cancelled => f.write_str("CANCELLED"),
            Self::Refunded => f.write_str("REFUNDED"),
        }
    }
}

/// Payment facts handed over by the checkout service at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payment {
    /// Total amount due.
    pub due: Money,
    /// Amount paid so far.
    pub paid: Money,
}

impl Payment {
    /// The status a sale lands in when committed with this payment:
    /// fully paid is `Completed`, partially paid is `Partial`, a credit
    /// sale with nothing paid yet is `Pending`.
    pub fn settled_status(self) -> SaleStatus {
        if self.paid >= self.due {
            SaleStatus::Completed
        } else if self.paid > Money::zero() {
            SaleStatus::Partial
        } else {
            SaleStatus::Pending
        }
    }
}

/// One line of a committed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    /// The product sold.
    pub product: ProductId,
    /// Units sold.
    pub quantity: u64,
    /// Per-unit sale price, kept for ledger valuation.
    pub unit_price: Money,
}

/// Record of a sale whose stock has been committed. Source of record for
/// the `sale` rows of the movement ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedSale {
    /// The external sale id (the ledger's deep-link reference).
    pub sale: SaleId,
    /// The session whose holds covered the sale.
    pub session: SessionId,
    /// The storefront the stock left.
    pub storefront: StorefrontId,
    /// Line items.
    pub lines: Vec<SaleLine>,
    /// Status the sale landed in (`Pending`, `Partial` or `Completed`).
    pub status: SaleStatus,
    /// When the stock was committed.
    pub committed_at: DateTime<Utc>,
}

/// Input for committing a draft sale's stock.
#[derive(Debug, Clone)]
pub struct SaleCommit {
    /// The external sale id.
    pub sale: SaleId,
    /// The session holding the reservations.
    pub session: SessionId,
    /// The storefront to deduct from.
    pub storefront: StorefrontId,
    /// Line items: product, units, unit price.
    pub lines: Vec<(ProductId, Quantity, Money)>,
    /// Payment facts deciding the post-commit status.
    pub payment: Payment,
}

/// Coordinates the atomic commit sequence between the external sale
/// lifecycle and the stock tables.
#[derive(Debug, Clone)]
pub struct SaleStockCoordinator<S> {
    store: Arc<S>,
    config: IntegrityConfig,
}

impl<S: InventoryStore> SaleStockCoordinator<S> {
    /// Creates a coordinator over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: IntegrityConfig::default(),
        }
    }

    /// Overrides the lock/retry discipline.
    #[must_use]
    pub fn with_config(mut self, config: IntegrityConfig) -> Self {
        self.config = config;
        self
    }

    /// Commits a draft sale's stock: deducts the storefront rows, records
    /// the sale for the ledger, and releases the session's holds as one
    /// atomic unit. A crash cannot leave stock committed with holds still
    /// counted.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InsufficientStock`] if re-validation under lock
    /// finds the units no longer fit (another cart got there first).
    pub async fn commit_sale(&self, commit: SaleCommit) -> InventoryResult<CommittedSale> {
        let mut attempt = 1;
        loop {
            match self.try_commit_sale(&commit).await {
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_commit_sale(&self, commit: &SaleCommit) -> InventoryResult<CommittedSale> {
        let now = Utc::now();
        let status = commit.payment.settled_status();

        // Lock every row the deduction will touch; `begin` orders the keys
        // deterministically so overlapping commits cannot deadlock.
        let keys: Vec<RowKey> = commit
            .lines
            .iter()
            .map(|(product, _, _)| RowKey::Storefront(commit.storefront.clone(), product.clone()))
            .collect();
        let mut tx = self.store.begin(keys, self.config.lock_timeout).await?;

        // Re-validate after acquiring the locks: time has passed since any
        // pre-flight check the caller ran. A cart may carry the same
        // product on several lines (different unit prices), so demand is
        // summed per product before checking it against the row.
        let mut demand: Vec<(&ProductId, u64)> = Vec::new();
        for (product, quantity, _) in &commit.lines {
            match demand.iter_mut().find(|(p, _)| *p == product) {
                Some((_, total)) => *total += quantity.get(),
                None => demand.push((product, quantity.get())),
            }
        }
        for (product, requested) in demand {
            let on_hand = tx.storefront_quantity(&commit.storefront, product).await?;
            let reserved_by_others: u64 = tx
                .reservations_for_product(product)
                .await?
                .iter()
                .filter(|r| {
                    r.is_active_at(now)
                        && r.session != commit.session
                        && r.storefront.as_ref() == Some(&commit.storefront)
                })
                .map(|r| r.quantity)
                .sum();
            let breakdown =
                AvailabilityBreakdown::storefront(on_hand, reserved_by_others, requested);
            if !breakdown.is_sufficient() {
                tracing::debug!(sale = %commit.sale, product = %product, %breakdown, "sale commit rejected");
                return Err(InventoryError::InsufficientStock { breakdown });
            }
        }

        // (a) commit stock: atomic decrements, never read-modify-write.
        for (product, quantity, _) in &commit.lines {
            tx.stage(StagedOp::AdjustStorefront {
                storefront: commit.storefront.clone(),
                product: product.clone(),
                delta: -i64::try_from(quantity.get()).unwrap_or(i64::MAX),
            });
        }

        // (b) record the sale in its settled status.
        let record = CommittedSale {
            sale: commit.sale.clone(),
            session: commit.session.clone(),
            storefront: commit.storefront.clone(),
            lines: commit
                .lines
                .iter()
                .map(|(product, quantity, unit_price)| SaleLine {
                    product: product.clone(),
                    quantity: quantity.get(),
                    unit_price: *unit_price,
                })
                .collect(),
            status,
            committed_at: now,
        };
        tx.stage(StagedOp::InsertSale(record.clone()));

        // (c) release the session's holds in the same transaction.
        for hold in tx.reservations_for_session(&commit.session).await? {
            if hold.status == ReservationStatus::Active {
                let next = if hold.lapsed_at(now) {
                    ReservationStatus::Expired
                } else {
                    ReservationStatus::Released
                };
                tx.stage(StagedOp::UpsertReservation(StockReservation {
                    status: next,
                    ..hold
                }));
            }
        }

        tx.commit().await?;
        tracing::info!(sale = %commit.sale, storefront = %commit.storefront, %status, "sale stock committed");
        Ok(record)
    }

    /// Releases a cancelled draft's holds. Touches no stock. Idempotent.
    pub async fn cancel_draft(&self, session: &SessionId) -> InventoryResult<usize> {
        let now = Utc::now();
        let holds = self.store.reservations_for_session(session).await?;
        let mut tx = self.store.begin(Vec::new(), self.config.lock_timeout).await?;
        let mut released = 0;
        for hold in holds {
            if hold.status == ReservationStatus::Active {
                let next = if hold.lapsed_at(now) {
                    ReservationStatus::Expired
                } else {
                    released += 1;
                    ReservationStatus::Released
                };
                tx.stage(StagedOp::UpsertReservation(StockReservation {
                    status: next,
                    ..hold
                }));
            }
        }
        tx.commit().await?;
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn money(d: rust_decimal::Decimal) -> Money {
        Money::new(d).unwrap()
    }

    #[test]
    fn only_draft_holds_reservations() {
        assert!(SaleStatus::Draft.holds_reservations());
        for status in [
            SaleStatus::Pending,
            SaleStatus::Partial,
            SaleStatus::Completed,
            SaleStatus::Cancelled,
            SaleStatus::Refunded,
        ] {
            assert!(!status.holds_reservations(), "{status} must not hold");
        }
    }

    #[test]
    fn full_payment_settles_completed() {
        let p = Payment {
            due: money(dec!(40.00)),
            paid: money(dec!(40.00)),
        };
        assert_eq!(p.settled_status(), SaleStatus::Completed);
    }

    #[test]
    fn partial_payment_settles_partial() {
        let p = Payment {
            due: money(dec!(40.00)),
            paid: money(dec!(15.00)),
        };
        assert_eq!(p.settled_status(), SaleStatus::Partial);
    }

    #[test]
    fn credit_sale_settles_pending() {
        let p = Payment {
            due: money(dec!(40.00)),
            paid: Money::zero(),
        };
        assert_eq!(p.settled_status(), SaleStatus::Pending);
    }

    #[test]
    fn overpayment_still_settles_completed() {
        let p = Payment {
            due: money(dec!(40.00)),
            paid: money(dec!(50.00)),
        };
        assert_eq!(p.settled_status(), SaleStatus::Completed);
    }
}
