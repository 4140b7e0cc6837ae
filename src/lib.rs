//! Commerce Orders Library
//!
//! Order pricing, voucher and manual discounts, fulfillment and stock
//! reconciliation. Services run inside a unit of work obtained from a
//! [`db::Store`]; plugin notifications are sent after commit.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod models;
pub mod money;
pub mod repositories;
pub mod services;

pub mod prelude {
    pub use crate::db::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::metrics::*;
    pub use crate::models::*;
    pub use crate::money::*;
    pub use crate::services::*;
}
