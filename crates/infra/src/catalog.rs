//! Product catalog lookups needed while posting stock.

use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;

use stockbook_core::{AccountId, BusinessId};
use stockbook_inventory::{ProductKey, ProductTracking};

/// What posting needs to know about a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductInfo {
    /// Inventory asset account; products without one are not stock-tracked.
    pub inventory_account_id: Option<AccountId>,
    pub is_batch_tracked: bool,
}

impl ProductInfo {
    pub fn tracked(inventory_account_id: AccountId) -> Self {
        Self {
            inventory_account_id: Some(inventory_account_id),
            is_batch_tracked: false,
        }
    }

    pub fn batch_tracked(inventory_account_id: AccountId) -> Self {
        Self {
            inventory_account_id: Some(inventory_account_id),
            is_batch_tracked: true,
        }
    }

    /// A service or non-stock product.
    pub fn untracked() -> Self {
        Self {
            inventory_account_id: None,
            is_batch_tracked: false,
        }
    }

    pub fn tracking(&self) -> ProductTracking {
        ProductTracking {
            is_inventory_tracked: self.inventory_account_id.is_some(),
            is_batch_tracked: self.is_batch_tracked,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown product {product} in business {business_id}")]
    UnknownProduct {
        business_id: BusinessId,
        product: ProductKey,
    },

    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Unavailable(_))
    }
}

/// Resolves product identities to their inventory configuration.
pub trait Catalog: Send + Sync {
    fn resolve_product(
        &self,
        business_id: BusinessId,
        product: &ProductKey,
    ) -> Result<ProductInfo, CatalogError>;
}

impl<C> Catalog for Arc<C>
where
    C: Catalog + ?Sized,
{
    fn resolve_product(
        &self,
        business_id: BusinessId,
        product: &ProductKey,
    ) -> Result<ProductInfo, CatalogError> {
        (**self).resolve_product(business_id, product)
    }
}

/// In-memory catalog.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: RwLock<HashMap<(BusinessId, ProductKey), ProductInfo>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, business_id: BusinessId, product: ProductKey, info: ProductInfo) {
        let mut products = self
            .products
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        products.insert((business_id, product), info);
    }
}

impl Catalog for InMemoryCatalog {
    fn resolve_product(
        &self,
        business_id: BusinessId,
        product: &ProductKey,
    ) -> Result<ProductInfo, CatalogError> {
        let products = self
            .products
            .read()
            .map_err(|_| CatalogError::Unavailable("lock poisoned".to_string()))?;
        products
            .get(&(business_id, *product))
            .copied()
            .ok_or(CatalogError::UnknownProduct {
                business_id,
                product: *product,
            })
    }
}

/// Catalog backed by the `stock_products` table.
///
/// Like the Postgres stock store it blocks on a captured runtime handle, so
/// it is only called from relay threads.
#[derive(Debug, Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
    handle: Handle,
}

impl PostgresCatalog {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }
}

impl Catalog for PostgresCatalog {
    fn resolve_product(
        &self,
        business_id: BusinessId,
        product: &ProductKey,
    ) -> Result<ProductInfo, CatalogError> {
        let row = self
            .handle
            .block_on(
                sqlx::query(
                    "SELECT inventory_account_id, is_batch_tracked FROM stock_products \
                     WHERE business_id = $1 AND product_type = $2 AND product_id = $3",
                )
                .bind(*business_id.as_uuid())
                .bind(product.product_type.as_str())
                .bind(*product.product_id.as_uuid())
                .fetch_optional(&self.pool),
            )
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?
            .ok_or(CatalogError::UnknownProduct {
                business_id,
                product: *product,
            })?;

        let account: Option<uuid::Uuid> = row
            .try_get("inventory_account_id")
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        let is_batch_tracked: bool = row
            .try_get("is_batch_tracked")
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        Ok(ProductInfo {
            inventory_account_id: account.map(AccountId::from),
            is_batch_tracked,
        })
    }
}
