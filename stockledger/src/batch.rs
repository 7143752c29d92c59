//! Stock batch store: durable record of physical stock intake.
//!
//! A batch is one intake of a product into a warehouse, with its own cost
//! structure and quantity. The quantity is write-once in practice: once any
//! movement (adjustment or transfer allocation) touches the batch, direct
//! edits are rejected and corrections must go through a new adjustment
//! record. Historical reports recompute available stock from
//! `intake - adjustments - transfers - sales`; silently editing intake after
//! the fact would invalidate every historical reconciliation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::{InventoryError, InventoryResult, StoreError};
use crate::integrity::IntegrityConfig;
use crate::store::{InventoryStore, InventoryTransaction, RowKey, StagedOp};
use crate::types::{BatchId, Money, ProductId, Quantity, WarehouseId};

/// Errors produced when constructing batch costs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CostError {
    /// The tax rate is negative.
    #[error("tax rate cannot be negative: {0}")]
    NegativeTaxRate(Decimal),
}

/// How the per-unit tax on a batch is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitTax {
    /// Tax derived from a rate applied to the unit cost.
    Rate(Decimal),
    /// Manually supplied tax amount (no rate on file).
    Amount(Money),
}

/// Per-unit cost structure of one intake batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCosts {
    /// Supplier unit cost.
    pub unit_cost: Money,
    /// Tax specification.
    pub tax: UnitTax,
    /// Freight, duty and other per-unit costs.
    pub unit_additional_cost: Money,
}

impl BatchCosts {
    /// Costs with tax derived from a rate (e.g. `0.18` for 18%).
    ///
    /// # Errors
    ///
    /// Rejects negative rates.
    pub fn with_tax_rate(
        unit_cost: Money,
        rate: Decimal,
        unit_additional_cost: Money,
    ) -> Result<Self, CostError> {
        if rate.is_sign_negative() {
            return Err(CostError::NegativeTaxRate(rate));
        }
        Ok(Self {
            unit_cost,
            tax: UnitTax::Rate(rate),
            unit_additional_cost,
        })
    }

    /// Costs with a manually supplied tax amount.
    pub const fn fixed_tax(unit_cost: Money, tax: Money, unit_additional_cost: Money) -> Self {
        Self {
            unit_cost,
            tax: UnitTax::Amount(tax),
            unit_additional_cost,
        }
    }

    /// The per-unit tax amount: `rate * unit_cost` when a rate is on file,
    /// otherwise the supplied amount.
    pub fn unit_tax_amount(&self) -> Money {
        match self.tax {
            UnitTax::Rate(rate) => Money::rounded(self.unit_cost.amount() * rate)
                .expect("product of non-negative amounts is non-negative"),
            UnitTax::Amount(amount) => amount,
        }
    }

    /// The all-in cost of one unit:
    /// `unit_cost + unit_tax_amount + unit_additional_cost`.
    pub fn landed_unit_cost(&self) -> Money {
        self.unit_cost
            .plus(self.unit_tax_amount())
            .plus(self.unit_additional_cost)
    }
}

/// One intake of a product into a warehouse.
///
/// Created once; destroyed only by data-retention policy, never by business
/// operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockBatch {
    /// Unique batch identifier.
    pub id: BatchId,
    /// The product received.
    pub product: ProductId,
    /// The receiving warehouse.
    pub warehouse: WarehouseId,
    /// Units received. Write-once after the first movement.
    pub quantity: u64,
    /// Per-unit cost structure.
    pub costs: BatchCosts,
    /// Supplier name, if recorded.
    pub supplier: Option<String>,
    /// When the stock arrived.
    pub arrival_date: DateTime<Utc>,
    /// Expiry date for perishable stock.
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Input for recording a new intake batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    /// The product received.
    pub product: ProductId,
    /// The receiving warehouse.
    pub warehouse: WarehouseId,
    /// Units received.
    pub quantity: Quantity,
    /// Per-unit cost structure.
    pub costs: BatchCosts,
    /// Supplier name, if recorded.
    pub supplier: Option<String>,
    /// When the stock arrived.
    pub arrival_date: DateTime<Utc>,
    /// Expiry date for perishable stock.
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Count and kind of movements pinning a batch's intake quantity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingMovements {
    /// Completed adjustments targeting the batch.
    pub adjustments: usize,
    /// Dispatched transfer allocations consuming the batch.
    pub transfer_allocations: usize,
}

impl BlockingMovements {
    /// Whether any movement pins the quantity.
    pub const fn any(&self) -> bool {
        self.adjustments + self.transfer_allocations > 0
    }
}

impl std::fmt::Display for BlockingMovements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} adjustment(s) and {} transfer allocation(s)",
            self.adjustments, self.transfer_allocations
        )
    }
}

/// Engine owning intake records.
#[derive(Debug, Clone)]
pub struct BatchIntake<S> {
    store: Arc<S>,
    config: IntegrityConfig,
}

impl<S: InventoryStore> BatchIntake<S> {
    /// Creates an intake engine over the given store.
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

    /// Records one intake batch.
    pub async fn create_batch(&self, new: NewBatch) -> InventoryResult<StockBatch> {
        let batch = StockBatch {
            id: BatchId::generate(),
            product: new.product,
            warehouse: new.warehouse,
            quantity: new.quantity.get(),
            costs: new.costs,
            supplier: new.supplier,
            arrival_date: new.arrival_date,
            expiry_date: new.expiry_date,
        };
        self.store.insert_batch(batch.clone()).await?;
        tracing::info!(batch = %batch.id, product = %batch.product, quantity = batch.quantity, "batch intake recorded");
        Ok(batch)
    }

    /// Returns the all-in per-unit cost of a batch.
    pub async fn landed_cost(&self, id: &BatchId) -> InventoryResult<Money> {
        let batch = self.store.batch(id).await?.ok_or_else(|| {
            InventoryError::from(StoreError::NotFound {
                entity: "batch",
                id: id.to_string(),
            })
        })?;
        Ok(batch.costs.landed_unit_cost())
    }

    /// Directly edits an intake quantity.
    ///
    /// Only legal while the batch has zero movements. Once an adjustment or
    /// transfer allocation exists the edit fails with
    /// [`InventoryError::QuantityLocked`] naming the blocking movements,
    /// and the correction must be issued as an adjustment instead.
    pub async fn correct_quantity(
        &self,
        id: &BatchId,
        quantity: Quantity,
    ) -> InventoryResult<StockBatch> {
        let mut attempt = 1;
        loop {
            match self.try_correct_quantity(id, quantity).await {
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_correct_quantity(
        &self,
        id: &BatchId,
        quantity: Quantity,
    ) -> InventoryResult<StockBatch> {
        let current = self.store.batch(id).await?.ok_or_else(|| {
            InventoryError::from(StoreError::NotFound {
                entity: "batch",
                id: id.to_string(),
            })
        })?;

        let keys = vec![
            RowKey::Batch(id.clone()),
            RowKey::Product(current.product.clone()),
        ];
        let mut tx = self.store.begin(keys, self.config.lock_timeout).await?;

        // Re-check under lock: a movement may have landed since the read.
        let blocking = tx.batch_movements(id).await?;
        if blocking.any() {
            tracing::debug!(batch = %id, %blocking, "quantity edit rejected, batch has movements");
            return Err(InventoryError::QuantityLocked {
                batch_id: id.clone(),
                blocking,
            });
        }

        let mut updated = tx.batch(id).await?.ok_or_else(|| {
            InventoryError::from(StoreError::NotFound {
                entity: "batch",
                id: id.to_string(),
            })
        })?;
        updated.quantity = quantity.get();

        tx.stage(StagedOp::SetBatchQuantity {
            batch: id.clone(),
            quantity: quantity.get(),
        });
        tx.commit().await?;
        tracing::info!(batch = %id, quantity = quantity.get(), "intake quantity corrected");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn money(d: Decimal) -> Money {
        Money::new(d).unwrap()
    }

    #[test]
    fn tax_amount_derived_from_rate() {
        let costs = BatchCosts::with_tax_rate(money(dec!(10.00)), dec!(0.18), money(dec!(0.50)))
            .unwrap();
        assert_eq!(costs.unit_tax_amount(), money(dec!(1.80)));
        assert_eq!(costs.landed_unit_cost(), money(dec!(12.30)));
    }

    #[test]
    fn tax_amount_rounds_to_cents() {
        let costs =
            BatchCosts::with_tax_rate(money(dec!(9.99)), dec!(0.075), Money::zero()).unwrap();
        // 9.99 * 0.075 = 0.74925, banker's rounding to 0.75.
        assert_eq!(costs.unit_tax_amount(), money(dec!(0.75)));
    }

    #[test]
    fn fixed_tax_used_verbatim_when_no_rate() {
        let costs = BatchCosts::fixed_tax(money(dec!(10.00)), money(dec!(2.00)), Money::zero());
        assert_eq!(costs.unit_tax_amount(), money(dec!(2.00)));
        assert_eq!(costs.landed_unit_cost(), money(dec!(12.00)));
    }

    #[test]
    fn negative_tax_rate_rejected() {
        let result = BatchCosts::with_tax_rate(money(dec!(10.00)), dec!(-0.1), Money::zero());
        assert!(matches!(result, Err(CostError::NegativeTaxRate(_))));
    }

    #[test]
    fn blocking_movements_display_names_counts() {
        let blocking = BlockingMovements {
            adjustments: 1,
            transfer_allocations: 0,
        };
        assert!(blocking.any());
        assert_eq!(
            blocking.to_string(),
            "1 adjustment(s) and 0 transfer allocation(s)"
        );
    }

    #[test]
    fn no_movements_means_nothing_blocks() {
        assert!(!BlockingMovements::default().any());
    }
}
