//! Core identifier and scalar types for the stock ledger.
//!
//! All identifiers use smart constructors so that validity is checked once,
//! at the boundary where raw input enters the system. Once a value exists it
//! is guaranteed valid everywhere else ("parse, don't validate").

use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifies a sellable product. Owned by the external catalog; the ledger
/// only ever references it.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProductId(String);

/// Identifies a warehouse holding intake batches.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct WarehouseId(String);

/// Identifies a storefront carrying denormalized on-hand stock.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StorefrontId(String);

/// Identifies one intake batch of a product into a warehouse.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct BatchId(String);

impl BatchId {
    /// Generates a new unique `BatchId`.
    pub fn generate() -> Self {
        Self::try_new(format!("BAT-{}", Uuid::now_v7().simple()))
            .expect("generated batch id is always valid")
    }
}

/// Identifies one transfer request from a warehouse to a storefront.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TransferId(String);

impl TransferId {
    /// Generates a new unique `TransferId`.
    pub fn generate() -> Self {
        Self::try_new(format!("TRF-{}", Uuid::now_v7().simple()))
            .expect("generated transfer id is always valid")
    }
}

/// Identifies one recorded stock adjustment (correction or shrinkage).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AdjustmentId(String);

impl AdjustmentId {
    /// Generates a new unique `AdjustmentId`.
    pub fn generate() -> Self {
        Self::try_new(format!("ADJ-{}", Uuid::now_v7().simple()))
            .expect("generated adjustment id is always valid")
    }
}

/// Identifies one stock reservation.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ReservationId(String);

impl ReservationId {
    /// Generates a new unique `ReservationId`.
    pub fn generate() -> Self {
        Self::try_new(format!("RSV-{}", Uuid::now_v7().simple()))
            .expect("generated reservation id is always valid")
    }
}

/// Identifies a sale owned by the external checkout service.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SaleId(String);

/// Identifies the cart/session a reservation is held for.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SessionId(String);

/// Identifies the user or system actor recorded in audit entries.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ActorId(String);

/// A requested unit count. Always strictly positive; "zero units" is not a
/// request the ledger accepts, it is the absence of one.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Quantity(u64);

impl Quantity {
    /// Returns the raw unit count.
    pub fn get(self) -> u64 {
        self.into_inner()
    }
}

/// Errors produced by the [`Money`] smart constructor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// The amount is negative, which is not allowed.
    #[error("money amount cannot be negative: {0}")]
    Negative(Decimal),

    /// The amount carries more than two decimal places.
    #[error("money can only have up to 2 decimal places, got: {0}")]
    TooManyDecimalPlaces(Decimal),
}

/// A non-negative monetary amount with at most two decimal places.
///
/// Used for unit costs, tax amounts, landed costs and movement valuations.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Money(Decimal);

impl Money {
    /// Creates a new `Money` value.
    ///
    /// # Errors
    ///
    /// Rejects negative amounts and amounts with more than two decimal
    /// places.
    pub fn new(amount: Decimal) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() {
            return Err(MoneyError::Negative(amount));
        }
        if amount.scale() > 2 {
            return Err(MoneyError::TooManyDecimalPlaces(amount));
        }
        Ok(Self(amount))
    }

    /// Creates a `Money` value, rounding to two decimal places
    /// (banker's rounding). Used for derived amounts such as tax computed
    /// from a rate.
    ///
    /// # Errors
    ///
    /// Rejects negative amounts.
    pub fn rounded(amount: Decimal) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() {
            return Err(MoneyError::Negative(amount));
        }
        Ok(Self(amount.round_dp(2)))
    }

    /// The zero amount.
    pub const fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Returns the underlying decimal amount.
    pub const fn amount(self) -> Decimal {
        self.0
    }

    /// Multiplies this per-unit amount by a unit count.
    pub fn times(self, units: u64) -> Decimal {
        self.0 * Decimal::from(units)
    }

    /// Sums two amounts. Cannot fail: non-negative plus non-negative stays
    /// non-negative and `rust_decimal` addition keeps the scale.
    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
