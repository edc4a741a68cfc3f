//! Corral Core
//!
//! Core types and abstractions shared by the Corral services.
//!
//! This crate contains:
//! - Domain types: Requests, Work Items, mounts and events
//! - DTOs: payloads exchanged with the store's HTTP API
//! - Priority derivation and the scheduler niceness mapping
//! - The manifest/locator codec for content-addressed output
//! - Collaborator traits for the Work-Item Store and the blob service

pub mod api;
pub mod blob;
pub mod domain;
pub mod dto;
pub mod error;
pub mod manifest;
pub mod priority;

pub use api::WorkItemApi;
pub use blob::{BlobStore, MemoryBlobStore};
pub use error::{BlobError, StoreError};
