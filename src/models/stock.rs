use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Quantity of one variant held in one warehouse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    pub id: Uuid,
    pub warehouse_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    /// Sum of all allocations against this row.
    pub quantity_allocated: i32,
}

impl Stock {
    pub fn new(warehouse_id: Uuid, variant_id: Uuid, quantity: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            warehouse_id,
            variant_id,
            quantity,
            quantity_allocated: 0,
        }
    }

    /// Quantity not reserved by any order line.
    pub fn available(&self) -> i32 {
        self.quantity - self.quantity_allocated
    }
}

/// Stock reserved for an order line before it is fulfilled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub order_line_id: Uuid,
    pub stock_id: Uuid,
    pub quantity_allocated: i32,
}

impl Allocation {
    pub fn new(order_line_id: Uuid, stock_id: Uuid, quantity_allocated: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_line_id,
            stock_id,
            quantity_allocated,
        }
    }
}
