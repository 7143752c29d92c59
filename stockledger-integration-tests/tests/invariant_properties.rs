//! Property tests for the stock invariants: whatever sequence of
//! operations is thrown at the engines, accepted operations reconcile
//! exactly with on-hand stock and holds never exceed availability.

use proptest::prelude::*;
use rust_decimal_macros::dec;
use tokio_test::block_on;

use stockledger::adjustment::{AdjustmentKind, AdjustmentTarget, NewAdjustment};
use stockledger::ledger::MovementFilter;
use stockledger::reservation::ReserveRequest;
use stockledger::sale::{Payment, SaleCommit};
use stockledger::store::InventoryStore;
use stockledger_integration_tests::{ids, money, qty, Harness};

#[derive(Debug, Clone)]
enum Op {
    Sale(u64),
    Shrinkage(u64),
    Correction(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..=10).prop_map(Op::Sale),
        (1u64..=5).prop_map(Op::Shrinkage),
        (1u64..=5).prop_map(Op::Correction),
    ]
}

const SEED: u64 = 50;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every accepted operation moves on-hand by exactly its delta, every
    /// rejected one moves nothing, and the derived ledger agrees with the
    /// final figure.
    #[test]
    fn accepted_operations_reconcile_with_on_hand(ops in prop::collection::vec(op_strategy(), 1..25)) {
        block_on(async {
            let h = Harness::new();
            let sf = ids::storefront("sf-1");
            let product = ids::product("p-1");
            h.seed_storefront(&sf, &product, SEED).await;

            let mut expected: i64 = i64::try_from(SEED).unwrap();
            for (i, op) in ops.iter().enumerate() {
                match op {
                    Op::Sale(units) => {
                        let result = h.sales.commit_sale(SaleCommit {
                            sale: ids::sale(&format!("S-{i}")),
                            session: ids::session(&format!("sess-{i}")),
                            storefront: sf.clone(),
                            lines: vec![(product.clone(), qty(*units), money(dec!(5.00)))],
                            payment: Payment {
                                due: money(dec!(5.00) * rust_decimal::Decimal::from(*units)),
                                paid: money(dec!(5.00) * rust_decimal::Decimal::from(*units)),
                            },
                        }).await;
                        let fits = i64::try_from(*units).unwrap() <= expected;
                        prop_assert_eq!(result.is_ok(), fits, "sale of {} against {}", units, expected);
                        if fits {
                            expected -= i64::try_from(*units).unwrap();
                        }
                    }
                    Op::Shrinkage(units) => {
                        let delta = -i64::try_from(*units).unwrap();
                        let result = h.adjustments.apply(NewAdjustment {
                            target: AdjustmentTarget::Storefront {
                                storefront: sf.clone(),
                                product: product.clone(),
                            },
                            delta,
                            kind: AdjustmentKind::Shrinkage,
                            reason: "damage".to_owned(),
                            actor: ids::actor("ops-1"),
                            unit_cost: None,
                        }).await;
                        let fits = -delta <= expected;
                        prop_assert_eq!(result.is_ok(), fits);
                        if fits {
                            expected += delta;
                        }
                    }
                    Op::Correction(units) => {
                        let delta = i64::try_from(*units).unwrap();
                        h.adjustments.apply(NewAdjustment {
                            target: AdjustmentTarget::Storefront {
                                storefront: sf.clone(),
                                product: product.clone(),
                            },
                            delta,
                            kind: AdjustmentKind::Correction,
                            reason: "recount".to_owned(),
                            actor: ids::actor("ops-1"),
                            unit_cost: None,
                        }).await.unwrap();
                        expected += delta;
                    }
                }
            }

            let on_hand = h.store.storefront_quantity(&sf, &product).await.unwrap();
            prop_assert_eq!(i64::try_from(on_hand).unwrap(), expected);

            // The derived ledger explains the distance from the seed.
            let summary = h.ledger.summary(&MovementFilter::default()).await.unwrap();
            prop_assert_eq!(
                summary.net_quantity_change,
                expected - i64::try_from(SEED).unwrap()
            );
            Ok(())
        })?;
    }

    /// Active holds can never exceed on-hand stock, regardless of the
    /// request pattern; overshooting requests are rejected whole.
    #[test]
    fn holds_never_exceed_on_hand(requests in prop::collection::vec(1u64..=12, 1..15)) {
        block_on(async {
            let h = Harness::new();
            let sf = ids::storefront("sf-1");
            let product = ids::product("p-1");
            h.seed_storefront(&sf, &product, 20).await;

            for (i, units) in requests.iter().enumerate() {
                // Each request comes from its own session, so nothing is
                // replaced and the holds accumulate until stock runs out.
                let _ = h.reservations.reserve(ReserveRequest {
                    session: ids::session(&format!("sess-{i}")),
                    sale: None,
                    product: product.clone(),
                    storefront: Some(sf.clone()),
                    quantity: qty(*units),
                    ttl: None,
                }).await;

                let reserved = h.reservations.reserved_quantity(&product).await.unwrap();
                prop_assert!(reserved <= 20, "reserved {} exceeds stock", reserved);
            }
            Ok(())
        })?;
    }
}
