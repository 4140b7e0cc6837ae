// Order use cases
pub mod orders;

// Pricing, vouchers and discounts
pub mod discounts;

// Stock allocation and reconciliation
pub mod inventory;

// Fulfillments, restocks and returns
pub mod fulfillments;

// Audit log helpers
pub mod order_events;

// Status derivation and pure predicates that work directly with models
pub mod order_status;

pub use discounts::{CustomerInfo, DiscountContext, DiscountService, SaleDiscount};
pub use fulfillments::{
    CreateFulfillmentsInput, CreateReturnInput, FulfillmentLineInput, FulfillmentService,
    ReturnLineInput, WarehouseLines,
};
pub use inventory::{StockRequest, StockService, StockTaken};
pub use orders::{OrderService, RecalculateOptions};
