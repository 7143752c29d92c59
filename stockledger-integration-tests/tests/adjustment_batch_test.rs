//! Batch intake rules and manual adjustments.

use std::collections::HashMap;

use rust_decimal_macros::dec;

use stockledger::adjustment::{AdjustmentKind, AdjustmentTarget, NewAdjustment};
use stockledger::errors::InventoryError;
use stockledger::ledger::{MovementFilter, MovementType, PageRequest};
use stockledger::store::InventoryStore;
use stockledger_integration_tests::{ids, money, qty, Harness};

fn shrinkage(target: AdjustmentTarget, delta: i64) -> NewAdjustment {
    NewAdjustment {
        target,
        delta,
        kind: AdjustmentKind::Shrinkage,
        reason: "water damage".to_owned(),
        actor: ids::actor("ops-1"),
        unit_cost: Some(money(dec!(11.00))),
    }
}

#[tokio::test]
async fn quantity_edit_allowed_only_before_movements() {
    let h = Harness::new();
    let batch = h.seed_batch(&ids::warehouse("wh-1"), &ids::product("p-1"), 100).await;

    // No movements yet: the direct edit goes through.
    let updated = h.intake.correct_quantity(&batch.id, qty(95)).await.unwrap();
    assert_eq!(updated.quantity, 95);

    // An adjustment now touches the batch.
    h.adjustments
        .apply(shrinkage(AdjustmentTarget::Batch(batch.id.clone()), -5))
        .await
        .unwrap();

    let err = h.intake.correct_quantity(&batch.id, qty(90)).await.unwrap_err();
    match err {
        InventoryError::QuantityLocked { batch_id, blocking } => {
            assert_eq!(batch_id, batch.id);
            assert_eq!(blocking.adjustments, 1);
        }
        other => panic!("expected QuantityLocked, got {other:?}"),
    }
    // The edit did not land.
    assert_eq!(h.store.batch(&batch.id).await.unwrap().unwrap().quantity, 95);
}

#[tokio::test]
async fn transfer_allocation_also_pins_the_quantity() {
    let h = Harness::new();
    let batch = h.seed_batch(&ids::warehouse("wh-1"), &ids::product("p-1"), 100).await;
    let actor = ids::actor("ops-1");

    let t = h
        .transfers
        .create_draft(
            stockledger::transfer::NewTransfer {
                warehouse: ids::warehouse("wh-1"),
                storefront: ids::storefront("sf-1"),
                lines: vec![(ids::product("p-1"), qty(10))],
                notes: None,
            },
            &actor,
        )
        .await
        .unwrap();
    let t = h.transfers.submit(&t.id, &actor).await.unwrap();
    let t = h.transfers.approve(&t.id, &HashMap::new(), &actor, None).await.unwrap();
    h.transfers.dispatch(&t.id, &actor, None).await.unwrap();

    let err = h.intake.correct_quantity(&batch.id, qty(90)).await.unwrap_err();
    match err {
        InventoryError::QuantityLocked { blocking, .. } => {
            assert_eq!(blocking.transfer_allocations, 1);
        }
        other => panic!("expected QuantityLocked, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_shrinkage_reduces_derived_availability() {
    let h = Harness::new();
    let batch = h.seed_batch(&ids::warehouse("wh-1"), &ids::product("p-1"), 100).await;

    h.adjustments
        .apply(shrinkage(AdjustmentTarget::Batch(batch.id.clone()), -8))
        .await
        .unwrap();

    let wh = h
        .store
        .warehouse_stock(&ids::warehouse("wh-1"), &ids::product("p-1"))
        .await
        .unwrap();
    // Intake is untouched; the derived view folds the adjustment in.
    assert_eq!(wh.intake(), 100);
    assert_eq!(wh.adjusted(), -8);
    assert_eq!(wh.available(), 92);
}

#[tokio::test]
async fn adjustment_cannot_overdraw_a_batch() {
    let h = Harness::new();
    let batch = h.seed_batch(&ids::warehouse("wh-1"), &ids::product("p-1"), 10).await;

    let err = h
        .adjustments
        .apply(shrinkage(AdjustmentTarget::Batch(batch.id.clone()), -11))
        .await
        .unwrap_err();
    match err {
        InventoryError::InsufficientStock { breakdown } => {
            assert_eq!(breakdown.available, 10);
            assert_eq!(breakdown.requested, 11);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
}

#[tokio::test]
async fn storefront_adjustment_updates_the_materialized_row() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 20).await;

    h.adjustments
        .apply(shrinkage(
            AdjustmentTarget::Storefront {
                storefront: ids::storefront("sf-1"),
                product: ids::product("p-1"),
            },
            -4,
        ))
        .await
        .unwrap();

    let on_hand = h
        .store
        .storefront_quantity(&ids::storefront("sf-1"), &ids::product("p-1"))
        .await
        .unwrap();
    assert_eq!(on_hand, 16);
}

#[tokio::test]
async fn storefront_adjustment_cannot_drive_on_hand_negative() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 3).await;

    let err = h
        .adjustments
        .apply(shrinkage(
            AdjustmentTarget::Storefront {
                storefront: ids::storefront("sf-1"),
                product: ids::product("p-1"),
            },
            -4,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::InsufficientStock { .. }));
    let on_hand = h
        .store
        .storefront_quantity(&ids::storefront("sf-1"), &ids::product("p-1"))
        .await
        .unwrap();
    assert_eq!(on_hand, 3);
}

#[tokio::test]
async fn zero_delta_is_rejected() {
    let h = Harness::new();
    let err = h
        .adjustments
        .apply(shrinkage(
            AdjustmentTarget::Warehouse {
                warehouse: ids::warehouse("wh-1"),
                product: ids::product("p-1"),
            },
            0,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::ConstraintViolation { .. }));
}

#[tokio::test]
async fn shrinkage_shows_up_valued_in_the_ledger() {
    let h = Harness::new();
    let batch = h.seed_batch(&ids::warehouse("wh-1"), &ids::product("p-1"), 100).await;
    h.adjustments
        .apply(shrinkage(AdjustmentTarget::Batch(batch.id.clone()), -8))
        .await
        .unwrap();

    let filter = MovementFilter {
        movement_types: vec![MovementType::Shrinkage],
        ..MovementFilter::default()
    };
    let page = h.ledger.list(&filter, &PageRequest::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].quantity, 8);

    let summary = h.ledger.summary(&filter).await.unwrap();
    assert_eq!(summary.shrinkage_units, 8);
    assert_eq!(summary.shrinkage_value, dec!(88.00));
    assert_eq!(summary.net_quantity_change, -8);
}

#[tokio::test]
async fn landed_cost_includes_tax_and_extras() {
    let h = Harness::new();
    let batch = h.seed_batch(&ids::warehouse("wh-1"), &ids::product("p-1"), 10).await;
    // Fixture costs: 10.00 unit + 1.00 tax + 0 extras.
    let landed = h.intake.landed_cost(&batch.id).await.unwrap();
    assert_eq!(landed, money(dec!(11.00)));
}
