//! Payment session backend
//!
//! Starts QR-invoice payments for a cart, confirms them through two
//! independent paths (gateway webhook and a periodic reconciliation sweep)
//! and materializes exactly one set of orders per paid invoice.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod locking;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod sessions;
pub mod workers;
