//! Data Transfer Objects for inter-service communication
//!
//! Payloads exchanged between the store's HTTP API and its clients
//! (dispatcher, runner, callers submitting Requests).

pub mod request;
pub mod work_item;
