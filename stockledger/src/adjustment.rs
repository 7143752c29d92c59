//! Manual stock adjustments: corrections and shrinkage write-offs.
//!
//! An adjustment is an append-only record carrying a signed unit delta
//! against one scope (a batch, a warehouse, or a storefront), who made it
//! and why. Warehouse-side deltas are never applied to a stored quantity;
//! the derived availability views fold them in. Storefront-side deltas
//! additionally update the denormalized on-hand row, since that row is
//! materialized.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{InventoryError, InventoryResult, StoreError};
use crate::integrity::{AvailabilityBreakdown, IntegrityConfig};
use crate::store::{InventoryStore, InventoryTransaction, RowKey, StagedOp};
use crate::types::{ActorId, AdjustmentId, BatchId, Money, ProductId, StorefrontId, WarehouseId};

/// Why the adjustment was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentKind {
    /// Count correction after a physical recount.
    Correction,
    /// Loss write-off: damage, theft, expiry.
    Shrinkage,
}

impl std::fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Correction => f.write_str("CORRECTION"),
            Self::Shrinkage => f.write_str("SHRINKAGE"),
        }
    }
}

/// Where the delta applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentScope {
    /// One intake batch; folds into that batch's remaining quantity.
    Batch {
        /// Warehouse holding the batch.
        warehouse: WarehouseId,
        /// The adjusted batch.
        batch: BatchId,
    },
    /// A warehouse without a specific batch; folds into the loose total.
    Warehouse {
        /// The adjusted warehouse.
        warehouse: WarehouseId,
    },
    /// A storefront's denormalized on-hand row.
    Storefront {
        /// The adjusted storefront.
        storefront: StorefrontId,
    },
}

impl AdjustmentScope {
    /// The warehouse this adjustment belongs to, if warehouse-side.
    pub const fn warehouse(&self) -> Option<&WarehouseId> {
        match self {
            Self::Batch { warehouse, .. } | Self::Warehouse { warehouse } => Some(warehouse),
            Self::Storefront { .. } => None,
        }
    }

    /// The storefront this adjustment belongs to, if storefront-side.
    pub const fn storefront(&self) -> Option<&StorefrontId> {
        match self {
            Self::Storefront { storefront } => Some(storefront),
            Self::Batch { .. } | Self::Warehouse { .. } => None,
        }
    }
}

/// One completed adjustment. Append-only; never edited or deleted, so the
/// movement ledger can replay it indefinitely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockAdjustment {
    /// Unique adjustment identifier.
    pub id: AdjustmentId,
    /// Where the delta applies.
    pub scope: AdjustmentScope,
    /// The adjusted product.
    pub product: ProductId,
    /// Signed unit delta. Never zero.
    pub delta: i64,
    /// Correction or shrinkage.
    pub kind: AdjustmentKind,
    /// Operator-supplied reason.
    pub reason: String,
    /// Who made the adjustment.
    pub actor: ActorId,
    /// Per-unit cost used to value the delta, when known.
    pub unit_cost: Option<Money>,
    /// When the adjustment was applied.
    pub applied_at: DateTime<Utc>,
}

impl StockAdjustment {
    /// Monetary value of the delta (`unit_cost * |delta|`), when a unit
    /// cost was recorded. Shrinkage reporting sums this.
    pub fn value(&self) -> Option<Decimal> {
        self.unit_cost.map(|cost| cost.times(self.delta.unsigned_abs()))
    }
}

/// Where a new adjustment should apply. Batch targets resolve their
/// product and warehouse from the batch record.
#[derive(Debug, Clone)]
pub enum AdjustmentTarget {
    /// One intake batch.
    Batch(BatchId),
    /// A warehouse, not tied to a batch.
    Warehouse {
        /// Target warehouse.
        warehouse: WarehouseId,
        /// Target product.
        product: ProductId,
    },
    /// A storefront's on-hand row.
    Storefront {
        /// Target storefront.
        storefront: StorefrontId,
        /// Target product.
        product: ProductId,
    },
}

/// Input for applying an adjustment.
#[derive(Debug, Clone)]
pub struct NewAdjustment {
    /// Where the delta applies.
    pub target: AdjustmentTarget,
    /// Signed unit delta. Must be nonzero.
    pub delta: i64,
    /// Correction or shrinkage.
    pub kind: AdjustmentKind,
    /// Operator-supplied reason.
    pub reason: String,
    /// Who is making the adjustment.
    pub actor: ActorId,
    /// Per-unit cost for valuation, when known.
    pub unit_cost: Option<Money>,
}

/// Engine applying manual adjustments under the shared lock discipline.
#[derive(Debug, Clone)]
pub struct AdjustmentEngine<S> {
    store: Arc<S>,
    config: IntegrityConfig,
}

impl<S: InventoryStore> AdjustmentEngine<S> {
    /// Creates an adjustment engine over the given store.
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

    /// Applies an adjustment: validates that a negative delta leaves the
    /// scope non-negative, records the append-only row, and (for
    /// storefront scope) updates the materialized on-hand quantity.
    pub async fn apply(&self, new: NewAdjustment) -> InventoryResult<StockAdjustment> {
        if new.delta == 0 {
            return Err(InventoryError::ConstraintViolation {
                constraint: "adjustment_delta_nonzero".to_owned(),
                detail: "an adjustment must move at least one unit".to_owned(),
            });
        }
        let mut attempt = 1;
        loop {
            match self.try_apply(&new).await {
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_apply(&self, new: &NewAdjustment) -> InventoryResult<StockAdjustment> {
        match &new.target {
            AdjustmentTarget::Batch(batch_id) => self.apply_to_batch(new.clone(), batch_id).await,
            AdjustmentTarget::Warehouse { warehouse, product } => {
                self.apply_to_warehouse(new.clone(), warehouse, product).await
            }
            AdjustmentTarget::Storefront { storefront, product } => {
                self.apply_to_storefront(new.clone(), storefront, product).await
            }
        }
    }

    async fn apply_to_batch(
        &self,
        new: NewAdjustment,
        batch_id: &BatchId,
    ) -> InventoryResult<StockAdjustment> {
        let batch = self
            .store
            .batch(batch_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "batch",
                id: batch_id.to_string(),
            })?;
        let keys = vec![
            RowKey::Batch(batch_id.clone()),
            RowKey::Product(batch.product.clone()),
        ];
        let mut tx = self.store.begin(keys, self.config.lock_timeout).await?;

        // Re-check the batch's remaining quantity under lock.
        let stock = tx.warehouse_stock(&batch.warehouse, &batch.product).await?;
        if let Some(view) = stock.batches.iter().find(|b| b.batch.id == *batch_id) {
            let remaining = view.remaining();
            if new.delta < 0 && remaining + new.delta < 0 {
                return Err(InventoryError::InsufficientStock {
                    breakdown: AvailabilityBreakdown {
                        on_hand: i64::try_from(view.batch.quantity).unwrap_or(i64::MAX),
                        adjustments: view.adjusted,
                        transferred_out: view.allocated_out,
                        reserved: 0,
                        requested: new.delta.unsigned_abs(),
                        available: remaining,
                    },
                });
            }
        }

        let record = finish(
            new,
            AdjustmentScope::Batch {
                warehouse: batch.warehouse.clone(),
                batch: batch_id.clone(),
            },
            batch.product,
        );
        tx.stage(StagedOp::InsertAdjustment(record.clone()));
        tx.commit().await?;
        tracing::info!(adjustment = %record.id, batch = %batch_id, delta = record.delta, "batch adjusted");
        Ok(record)
    }

    async fn apply_to_warehouse(
        &self,
        new: NewAdjustment,
        warehouse: &WarehouseId,
        product: &ProductId,
    ) -> InventoryResult<StockAdjustment> {
        let keys = vec![RowKey::Product(product.clone())];
        let mut tx = self.store.begin(keys, self.config.lock_timeout).await?;
        let stock = tx.warehouse_stock(warehouse, product).await?;
        if new.delta < 0 && stock.available() + new.delta < 0 {
            return Err(InventoryError::InsufficientStock {
                breakdown: AvailabilityBreakdown::warehouse(&stock, 0, new.delta.unsigned_abs()),
            });
        }
        let record = finish(
            new,
            AdjustmentScope::Warehouse {
                warehouse: warehouse.clone(),
            },
            product.clone(),
        );
        tx.stage(StagedOp::InsertAdjustment(record.clone()));
        tx.commit().await?;
        tracing::info!(adjustment = %record.id, warehouse = %warehouse, delta = record.delta, "warehouse stock adjusted");
        Ok(record)
    }

    async fn apply_to_storefront(
        &self,
        new: NewAdjustment,
        storefront: &StorefrontId,
        product: &ProductId,
    ) -> InventoryResult<StockAdjustment> {
        let keys = vec![RowKey::Storefront(storefront.clone(), product.clone())];
        let mut tx = self.store.begin(keys, self.config.lock_timeout).await?;
        let on_hand = tx.storefront_quantity(storefront, product).await?;
        let on_hand_signed = i64::try_from(on_hand).unwrap_or(i64::MAX);
        if new.delta < 0 && on_hand_signed + new.delta < 0 {
            return Err(InventoryError::InsufficientStock {
                breakdown: AvailabilityBreakdown::storefront(on_hand, 0, new.delta.unsigned_abs()),
            });
        }
        let record = finish(
            new,
            AdjustmentScope::Storefront {
                storefront: storefront.clone(),
            },
            product.clone(),
        );
        // The storefront row is materialized, so the delta is applied to it
        // in the same commit as the record insert.
        tx.stage(StagedOp::AdjustStorefront {
            storefront: storefront.clone(),
            product: product.clone(),
            delta: record.delta,
        });
        tx.stage(StagedOp::InsertAdjustment(record.clone()));
        tx.commit().await?;
        tracing::info!(adjustment = %record.id, storefront = %storefront, delta = record.delta, "storefront stock adjusted");
        Ok(record)
    }
}

fn finish(new: NewAdjustment, scope: AdjustmentScope, product: ProductId) -> StockAdjustment {
    StockAdjustment {
        id: AdjustmentId::generate(),
        scope,
        product,
        delta: new.delta,
        kind: new.kind,
        reason: new.reason,
        actor: new.actor,
        unit_cost: new.unit_cost,
        applied_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(delta: i64, unit_cost: Option<Money>) -> StockAdjustment {
        StockAdjustment {
            id: AdjustmentId::generate(),
            scope: AdjustmentScope::Warehouse {
                warehouse: WarehouseId::try_new("wh-1").unwrap(),
            },
            product: ProductId::try_new("p-1").unwrap(),
            delta,
            kind: AdjustmentKind::Shrinkage,
            reason: "water damage".to_owned(),
            actor: ActorId::try_new("ops-1").unwrap(),
            unit_cost,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn value_multiplies_unit_cost_by_magnitude() {
        let adj = record(-3, Some(Money::new(dec!(4.50)).unwrap()));
        assert_eq!(adj.value(), Some(dec!(13.50)));
    }

    #[test]
    fn value_is_none_without_unit_cost() {
        assert_eq!(record(-3, None).value(), None);
    }

    #[test]
    fn scope_accessors_split_sides() {
        let wh = WarehouseId::try_new("wh-1").unwrap();
        let sf = StorefrontId::try_new("sf-1").unwrap();
        let warehouse_scope = AdjustmentScope::Warehouse { warehouse: wh.clone() };
        assert_eq!(warehouse_scope.warehouse(), Some(&wh));
        assert_eq!(warehouse_scope.storefront(), None);
        let storefront_scope = AdjustmentScope::Storefront { storefront: sf.clone() };
        assert_eq!(storefront_scope.warehouse(), None);
        assert_eq!(storefront_scope.storefront(), Some(&sf));
    }

    #[test]
    fn kind_display_uses_wire_names() {
        assert_eq!(AdjustmentKind::Correction.to_string(), "CORRECTION");
        assert_eq!(AdjustmentKind::Shrinkage.to_string(), "SHRINKAGE");
    }
}
