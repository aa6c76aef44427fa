//! Mail intake — email ingestion, routing and per-tenant batching.

pub mod batch;
pub mod channels;
pub mod config;
pub mod error;
pub mod extraction;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
