//! Ingestion pipeline.
//!
//! Every raw message, whatever its source, flows through:
//! 1. `parser::parse()`: raw bytes to `InboundMessage`, never fails
//! 2. the processed-marker check (exactly-once dispatch)
//! 3. `Router::route()`: recipient tables to a lane
//! 4. the lane: a `WorkHandler` (with `ReplyCorrelator` for replies) or the
//!    per-tenant `BatchQueue`
//!
//! `dispatcher::Dispatcher` drives the steps on a single task.

pub mod correlator;
pub mod dispatcher;
pub mod handler;
pub mod parser;
pub mod router;
pub mod types;
