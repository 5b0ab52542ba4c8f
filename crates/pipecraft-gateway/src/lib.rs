//! HTTP/WebSocket gateway exposing the external command verbs
//! (`getSnapshot`, `startRun`, `submitFollowUp`, `approveTask`,
//! `commentOnTask`, `configureWorkers`, `startWorkers`, `stopWorkers`) and
//! a per-worktree event stream, with API-key auth and rate-limiting
//! middleware in front.
//!
//! # Main types
//!
//! - [`GatewayServer`] — builds the Axum router.
//! - [`WorktreeRegistry`] — looks up (or creates) a worktree's [`RunController`](pipecraft_run::RunController).
//! - [`AuthConfig`] — API-key authentication configuration.

/// HTTP error body mapping for [`pipecraft_core::PipecraftError`].
pub mod errors;
/// Authentication and rate-limiting middleware.
pub mod middleware;
/// Token-bucket rate limiter.
pub mod rate_limit;
/// Per-worktree `RunController` lookup.
pub mod registry;
/// Command-verb HTTP handlers.
pub mod router;
/// Gateway server builder and the event-stream WebSocket route.
pub mod server;

pub use middleware::AuthConfig;
pub use rate_limit::RateLimiter;
pub use registry::WorktreeRegistry;
pub use server::GatewayServer;
