//! Client-side request resilience and offline synchronization for the
//! case-management backend.
//!
//! - [`api`]: retrying, timeout-bounded request client with bearer auth
//! - [`session`]: persisted token and the `auth:logout` signal
//! - [`sync`]: durable offline mutation queue and connectivity tracking
//! - [`cache`]: last-known-good responses for offline reads

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod session;
pub mod sync;
