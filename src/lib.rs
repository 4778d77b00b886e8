//! General-purpose incremental sync framework.
//!
//! This crate knows nothing about any particular API: it provides the rate
//! limiter, retrying invoker, paginator, shard planner, spool, orchestrator,
//! `Stream` trait, sync driver, state manager, and NDJSON message protocol
//! that a concrete connector composes against. See `source-klaviyo` for the
//! Klaviyo connector built on top of it.

pub mod dag;
pub mod driver;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod paginate;
pub mod ratelimit;
pub mod shard;
pub mod spool;
pub mod state;
pub mod stream;

pub use error::SourceError;
