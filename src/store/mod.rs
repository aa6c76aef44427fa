//! Persistence layer: the `MessageStore` boundary and its libSQL backend.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    InboundRecord, MessageStore, NewWorkUnit, OutcomePath, OutcomeRecord, PendingRecord,
    RecordStatus, WorkUnit,
};
