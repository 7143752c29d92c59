//! Shared fixtures for the stockledger integration tests.
//!
//! The tests drive every engine against the in-memory adapter, which
//! implements the same row-lock discipline as a database-backed store, so
//! the concurrency scenarios here exercise real lock contention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use stockledger::adjustment::AdjustmentEngine;
use stockledger::batch::{BatchCosts, BatchIntake, NewBatch, StockBatch};
use stockledger::ledger::MovementLedger;
use stockledger::reservation::ReservationManager;
use stockledger::sale::SaleStockCoordinator;
use stockledger::store::{InventoryStore, InventoryTransaction, RowKey, StagedOp};
use stockledger::transfer::TransferEngine;
use stockledger::types::{
    ActorId, Money, ProductId, Quantity, SessionId, StorefrontId, WarehouseId,
};
use stockledger_memory::InMemoryInventoryStore;

/// Installs a test tracing subscriber honoring `RUST_LOG`. Safe to call
/// from every test; only the first call installs.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Every engine wired to one shared in-memory store.
pub struct Harness {
    /// The shared store.
    pub store: Arc<InMemoryInventoryStore>,
    /// Batch intake engine.
    pub intake: BatchIntake<InMemoryInventoryStore>,
    /// Reservation manager.
    pub reservations: ReservationManager<InMemoryInventoryStore>,
    /// Sale commit coordinator.
    pub sales: SaleStockCoordinator<InMemoryInventoryStore>,
    /// Transfer workflow engine.
    pub transfers: TransferEngine<InMemoryInventoryStore>,
    /// Adjustment engine.
    pub adjustments: AdjustmentEngine<InMemoryInventoryStore>,
    /// Movement ledger.
    pub ledger: MovementLedger<InMemoryInventoryStore>,
}

impl Harness {
    /// Builds a harness over a fresh empty store.
    pub fn new() -> Self {
        let store = Arc::new(InMemoryInventoryStore::new());
        Self {
            intake: BatchIntake::new(Arc::clone(&store)),
            reservations: ReservationManager::new(Arc::clone(&store)),
            sales: SaleStockCoordinator::new(Arc::clone(&store)),
            transfers: TransferEngine::new(Arc::clone(&store)),
            adjustments: AdjustmentEngine::new(Arc::clone(&store)),
            ledger: MovementLedger::new(Arc::clone(&store)),
            store,
        }
    }

    /// Sets a storefront's on-hand quantity directly, bypassing the
    /// transfer workflow, for tests that start from stocked shelves.
    pub async fn seed_storefront(&self, storefront: &StorefrontId, product: &ProductId, qty: u64) {
        let mut tx = self
            .store
            .begin(
                vec![RowKey::Storefront(storefront.clone(), product.clone())],
                Duration::from_secs(1),
            )
            .await
            .expect("seed lock");
        tx.stage(StagedOp::AdjustStorefront {
            storefront: storefront.clone(),
            product: product.clone(),
            delta: i64::try_from(qty).expect("seed quantity fits"),
        });
        tx.commit().await.expect("seed commit");
    }

    /// Records an intake batch with a flat landed cost of 11.00 per unit.
    pub async fn seed_batch(
        &self,
        warehouse: &WarehouseId,
        product: &ProductId,
        qty: u64,
    ) -> StockBatch {
        self.intake
            .create_batch(NewBatch {
                product: product.clone(),
                warehouse: warehouse.clone(),
                quantity: Quantity::try_new(qty).expect("seed quantity positive"),
                costs: BatchCosts::fixed_tax(
                    Money::new(dec!(10.00)).expect("valid cost"),
                    Money::new(dec!(1.00)).expect("valid tax"),
                    Money::zero(),
                ),
                supplier: Some("acme supply".to_owned()),
                arrival_date: Utc::now(),
                expiry_date: None,
            })
            .await
            .expect("seed batch")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand id constructors for tests.
pub mod ids {
    use super::{ActorId, ProductId, SessionId, StorefrontId, WarehouseId};
    use stockledger::types::SaleId;

    /// Product id from a literal.
    pub fn product(s: &str) -> ProductId {
        ProductId::try_new(s).expect("valid product id")
    }

    /// Warehouse id from a literal.
    pub fn warehouse(s: &str) -> WarehouseId {
        WarehouseId::try_new(s).expect("valid warehouse id")
    }

    /// Storefront id from a literal.
    pub fn storefront(s: &str) -> StorefrontId {
        StorefrontId::try_new(s).expect("valid storefront id")
    }

    /// Session id from a literal.
    pub fn session(s: &str) -> SessionId {
        SessionId::try_new(s).expect("valid session id")
    }

    /// Sale id from a literal.
    pub fn sale(s: &str) -> SaleId {
        SaleId::try_new(s).expect("valid sale id")
    }

    /// Actor id from a literal.
    pub fn actor(s: &str) -> ActorId {
        ActorId::try_new(s).expect("valid actor id")
    }
}

/// Positive quantity from a literal.
pub fn qty(n: u64) -> Quantity {
    Quantity::try_new(n).expect("positive quantity")
}

/// Money from a two-decimal literal.
pub fn money(d: rust_decimal::Decimal) -> Money {
    Money::new(d).expect("valid money")
}
