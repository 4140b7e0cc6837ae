pub mod catalogue;
pub mod fulfillment;
pub mod order;
pub mod order_discount;
pub mod order_event;
pub mod order_line;
pub mod payment;
pub mod sale;
pub mod stock;
pub mod voucher;

pub use catalogue::Catalogue;
pub use fulfillment::{Fulfillment, FulfillmentLine, FulfillmentStatus};
pub use order::{Order, OrderFilterOptions, OrderStatus};
pub use order_discount::{DiscountInput, DiscountValueType, OrderDiscount, OrderDiscountType};
pub use order_event::{OrderEvent, OrderEventOption, OrderEventType};
pub use order_line::{OrderLine, VariantSnapshot};
pub use payment::{ChargeStatus, Payment, PaymentTransaction, TransactionKind};
pub use sale::{Sale, SaleChannelListing};
pub use stock::{Allocation, Stock};
pub use voucher::{Voucher, VoucherChannelListing, VoucherCustomer, VoucherType};
