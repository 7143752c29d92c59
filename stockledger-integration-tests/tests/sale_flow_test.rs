//! Storefront sale flow: reservations, availability, and the atomic
//! commit sequence.

use std::time::Duration;

use rust_decimal_macros::dec;

use stockledger::errors::InventoryError;
use stockledger::reservation::{ReservationStatus, ReserveRequest, StockScope};
use stockledger::sale::{Payment, SaleCommit, SaleStatus};
use stockledger::store::InventoryStore;
use stockledger_integration_tests::{ids, money, qty, Harness};

fn reserve_request(session: &str, quantity: u64) -> ReserveRequest {
    ReserveRequest {
        session: ids::session(session),
        sale: None,
        product: ids::product("p-1"),
        storefront: Some(ids::storefront("sf-1")),
        quantity: qty(quantity),
        ttl: None,
    }
}

fn commit(session: &str, sale: &str, quantity: u64, paid: rust_decimal::Decimal) -> SaleCommit {
    SaleCommit {
        sale: ids::sale(sale),
        session: ids::session(session),
        storefront: ids::storefront("sf-1"),
        lines: vec![(ids::product("p-1"), qty(quantity), money(dec!(20.00)))],
        payment: Payment {
            due: money(dec!(20.00) * rust_decimal::Decimal::from(quantity)),
            paid: money(paid),
        },
    }
}

#[tokio::test]
async fn two_carts_cannot_hold_the_same_units() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;

    let first = h.reservations.reserve(reserve_request("cart-a", 6)).await.unwrap();
    assert_eq!(first.quantity, 6);
    assert_eq!(first.status, ReservationStatus::Active);

    // 10 on hand minus 6 held leaves 4; a second 6-unit hold must fail with
    // the full breakdown.
    let err = h.reservations.reserve(reserve_request("cart-b", 6)).await.unwrap_err();
    match err {
        InventoryError::InsufficientStock { breakdown } => {
            assert_eq!(breakdown.on_hand, 10);
            assert_eq!(breakdown.reserved, 6);
            assert_eq!(breakdown.available, 4);
            assert_eq!(breakdown.requested, 6);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }

    // A 4-unit hold still fits.
    assert!(h.reservations.reserve(reserve_request("cart-b", 4)).await.is_ok());
}

#[tokio::test]
async fn re_reserving_replaces_the_sessions_hold() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;

    let first = h.reservations.reserve(reserve_request("cart-a", 6)).await.unwrap();
    // Shrinking the line does not stack a second hold.
    let second = h.reservations.reserve(reserve_request("cart-a", 2)).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(
        h.reservations.reserved_quantity(&ids::product("p-1")).await.unwrap(),
        2
    );
    // The freed units are visible to another cart.
    assert!(h.reservations.reserve(reserve_request("cart-b", 8)).await.is_ok());
}

#[tokio::test]
async fn commit_deducts_stock_and_releases_holds_atomically() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;
    h.reservations.reserve(reserve_request("cart-a", 6)).await.unwrap();

    let record = h.sales.commit_sale(commit("cart-a", "S-1", 6, dec!(120.00))).await.unwrap();
    assert_eq!(record.status, SaleStatus::Completed);

    let on_hand = h
        .store
        .storefront_quantity(&ids::storefront("sf-1"), &ids::product("p-1"))
        .await
        .unwrap();
    assert_eq!(on_hand, 4);
    assert_eq!(
        h.reservations.reserved_quantity(&ids::product("p-1")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn partial_payment_commits_stock_in_partial_status() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;
    let record = h.sales.commit_sale(commit("cart-a", "S-1", 2, dec!(10.00))).await.unwrap();
    assert_eq!(record.status, SaleStatus::Partial);
    // Partial settlement still deducts the full quantity.
    let on_hand = h
        .store
        .storefront_quantity(&ids::storefront("sf-1"), &ids::product("p-1"))
        .await
        .unwrap();
    assert_eq!(on_hand, 8);
}

#[tokio::test]
async fn repeated_product_lines_validate_against_their_sum() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;

    // Two 6-unit lines of the same product at different prices: each fits
    // on its own, their sum does not.
    let over = SaleCommit {
        sale: ids::sale("S-1"),
        session: ids::session("cart-a"),
        storefront: ids::storefront("sf-1"),
        lines: vec![
            (ids::product("p-1"), qty(6), money(dec!(20.00))),
            (ids::product("p-1"), qty(6), money(dec!(18.00))),
        ],
        payment: Payment {
            due: money(dec!(228.00)),
            paid: money(dec!(228.00)),
        },
    };
    let err = h.sales.commit_sale(over).await.unwrap_err();
    match err {
        InventoryError::InsufficientStock { breakdown } => {
            assert_eq!(breakdown.requested, 12);
            assert_eq!(breakdown.available, 10);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
    let on_hand = h
        .store
        .storefront_quantity(&ids::storefront("sf-1"), &ids::product("p-1"))
        .await
        .unwrap();
    assert_eq!(on_hand, 10);

    // A split cart whose sum fits commits both lines.
    let fits = SaleCommit {
        sale: ids::sale("S-2"),
        session: ids::session("cart-a"),
        storefront: ids::storefront("sf-1"),
        lines: vec![
            (ids::product("p-1"), qty(6), money(dec!(20.00))),
            (ids::product("p-1"), qty(4), money(dec!(18.00))),
        ],
        payment: Payment {
            due: money(dec!(192.00)),
            paid: money(dec!(192.00)),
        },
    };
    let record = h.sales.commit_sale(fits).await.unwrap();
    assert_eq!(record.lines.len(), 2);
    let on_hand = h
        .store
        .storefront_quantity(&ids::storefront("sf-1"), &ids::product("p-1"))
        .await
        .unwrap();
    assert_eq!(on_hand, 0);
}

#[tokio::test]
async fn credit_sale_commits_pending_and_leaves_no_holds() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;
    h.reservations.reserve(reserve_request("cart-a", 6)).await.unwrap();

    // Nothing paid yet: the sale lands Pending with the stock committed.
    let record = h.sales.commit_sale(commit("cart-a", "S-1", 6, dec!(0.00))).await.unwrap();
    assert_eq!(record.status, SaleStatus::Pending);
    let on_hand = h
        .store
        .storefront_quantity(&ids::storefront("sf-1"), &ids::product("p-1"))
        .await
        .unwrap();
    assert_eq!(on_hand, 4);

    // The cart's holds were released in the same transaction; the
    // remaining units are fully sellable.
    let probe = h
        .reservations
        .get_availability(
            &StockScope::Storefront(ids::storefront("sf-1")),
            &ids::product("p-1"),
            qty(4),
        )
        .await
        .unwrap();
    assert!(probe.is_available);
    assert_eq!(probe.available_quantity, 4);
    assert_eq!(probe.breakdown.reserved, 0);
}

#[tokio::test]
async fn commit_revalidates_against_other_sessions_holds() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;
    h.reservations.reserve(reserve_request("cart-b", 8)).await.unwrap();

    // cart-a never reserved; its 6-unit commit cannot take cart-b's units.
    let err = h.sales.commit_sale(commit("cart-a", "S-1", 6, dec!(120.00))).await.unwrap_err();
    assert!(matches!(err, InventoryError::InsufficientStock { .. }));

    // cart-b's own commit is unaffected by its own hold.
    assert!(h.sales.commit_sale(commit("cart-b", "S-2", 8, dec!(160.00))).await.is_ok());
}

#[tokio::test]
async fn expired_hold_stops_counting_without_a_sweep() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;
    let mut request = reserve_request("cart-a", 6);
    request.ttl = Some(Duration::from_millis(20));
    h.reservations.reserve(request).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Lazy expiry: no sweep has run, but the lapsed hold no longer counts.
    assert_eq!(
        h.reservations.reserved_quantity(&ids::product("p-1")).await.unwrap(),
        0
    );
    let probe = h
        .reservations
        .get_availability(
            &StockScope::Storefront(ids::storefront("sf-1")),
            &ids::product("p-1"),
            qty(10),
        )
        .await
        .unwrap();
    assert!(probe.is_available);
    assert_eq!(probe.available_quantity, 10);

    // The sweep then persists what the reads already concluded.
    assert_eq!(h.reservations.sweep_expired().await.unwrap(), 1);
    assert_eq!(h.reservations.sweep_expired().await.unwrap(), 0);
}

#[tokio::test]
async fn extend_does_not_revive_a_lapsed_hold() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;
    let mut request = reserve_request("cart-a", 6);
    request.ttl = Some(Duration::from_millis(20));
    h.reservations.reserve(request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let extended = h
        .reservations
        .extend(&ids::session("cart-a"), Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(extended, 0);
    assert_eq!(
        h.reservations.reserved_quantity(&ids::product("p-1")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn cancelling_a_draft_releases_holds_and_touches_no_stock() {
    let h = Harness::new();
    h.seed_storefront(&ids::storefront("sf-1"), &ids::product("p-1"), 10)
        .await;
    h.reservations.reserve(reserve_request("cart-a", 6)).await.unwrap();

    assert_eq!(h.sales.cancel_draft(&ids::session("cart-a")).await.unwrap(), 1);
    // Idempotent.
    assert_eq!(h.sales.cancel_draft(&ids::session("cart-a")).await.unwrap(), 0);

    let on_hand = h
        .store
        .storefront_quantity(&ids::storefront("sf-1"), &ids::product("p-1"))
        .await
        .unwrap();
    assert_eq!(on_hand, 10);
    assert_eq!(
        h.reservations.reserved_quantity(&ids::product("p-1")).await.unwrap(),
        0
    );
}
