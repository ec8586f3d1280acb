use core::str::FromStr;
use serde::{Deserialize, Serialize};

use stockbook_core::{BusinessId, DomainError, ProductId, WarehouseId};

/// Catalog product shape. Closed set; stock is always tracked per concrete id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Single,
    Group,
    Variant,
    Composite,
    Imported,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Single => "single",
            ProductType::Group => "group",
            ProductType::Variant => "variant",
            ProductType::Composite => "composite",
            ProductType::Imported => "imported",
        }
    }
}

impl FromStr for ProductType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ProductType::Single),
            "group" => Ok(ProductType::Group),
            "variant" => Ok(ProductType::Variant),
            "composite" => Ok(ProductType::Composite),
            "imported" => Ok(ProductType::Imported),
            other => Err(DomainError::validation(format!("unknown product type: {other}"))),
        }
    }
}

/// Product identity as referenced by documents and ledger rows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    pub product_type: ProductType,
    pub product_id: ProductId,
}

impl ProductKey {
    pub fn new(product_type: ProductType, product_id: ProductId) -> Self {
        Self {
            product_type,
            product_id,
        }
    }

    pub fn single(product_id: ProductId) -> Self {
        Self::new(ProductType::Single, product_id)
    }
}

impl core::fmt::Display for ProductKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.product_type.as_str(), self.product_id)
    }
}

/// The (business, warehouse, product, batch) key every stock table is keyed by.
///
/// An empty `batch_number` is the untracked batch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub business_id: BusinessId,
    pub warehouse_id: WarehouseId,
    pub product: ProductKey,
    pub batch_number: String,
}

impl StockKey {
    pub fn new(
        business_id: BusinessId,
        warehouse_id: WarehouseId,
        product: ProductKey,
        batch_number: impl Into<String>,
    ) -> Self {
        Self {
            business_id,
            warehouse_id,
            product,
            batch_number: batch_number.into(),
        }
    }

    pub fn untracked(business_id: BusinessId, warehouse_id: WarehouseId, product: ProductKey) -> Self {
        Self::new(business_id, warehouse_id, product, String::new())
    }

    /// Same product and batch in another warehouse.
    pub fn in_warehouse(&self, warehouse_id: WarehouseId) -> Self {
        Self {
            warehouse_id,
            ..self.clone()
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.warehouse_id, self.product, self.batch_number)
    }
}
