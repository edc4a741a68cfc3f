//! Corral Store
//!
//! The Work-Item Store: Requests, Work Items, priority reconciliation and
//! the HTTP API the dispatcher and runners talk to.

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod sweep;

pub use api::create_router;
pub use config::Config;
pub use store::Store;
