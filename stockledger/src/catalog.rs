//! Read-only view of the external product catalog.
//!
//! The ledger references products by id and never owns their descriptive
//! data. Category aggregation needs the product-to-category mapping, so the
//! ledger takes it through this trait rather than duplicating catalog rows.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::StoreResult;
use crate::types::ProductId;

/// Descriptive product facts the ledger reports alongside movements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    /// Stock-keeping unit code.
    pub sku: String,
    /// Human-readable name.
    pub name: String,
    /// Reporting category, when the catalog has one.
    pub category: Option<String>,
}

/// Lookup into the external catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolves one product; `None` when the catalog does not know it.
    async fn product(&self, id: &ProductId) -> StoreResult<Option<ProductInfo>>;
}

/// Static in-memory catalog, for tests and single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct MapCatalog {
    products: HashMap<ProductId, ProductInfo>,
}

impl MapCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces one product.
    pub fn insert(&mut self, id: ProductId, info: ProductInfo) {
        self.products.insert(id, info);
    }
}

#[async_trait]
impl Catalog for MapCatalog {
    async fn product(&self, id: &ProductId) -> StoreResult<Option<ProductInfo>> {
        Ok(self.products.get(id).cloned())
    }
}
