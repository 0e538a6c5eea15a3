//! Rust driver for the Stratus managed NoSQL database service.
//!
//! A [`Client`] turns typed requests (point reads and writes, batched
//! writes, ranged deletes, SQL queries, table DDL) into HTTP exchanges with
//! the service, while enforcing end-to-end deadlines, negotiating the wire
//! protocol version, pacing itself under per-table throughput limits, and
//! retrying transient failures. Queries that the server distributes across
//! shards or partitions are reassembled client-side by a plan runtime that
//! sorts, groups, deduplicates and projects partial results under a memory
//! budget.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod limiter;
pub mod paging;
pub mod query;
pub mod requests;
pub mod results;
pub mod retry;
pub mod table;
pub mod value;

mod compare;
mod protocol;
mod rate_limiting;
mod transport;

// Re-export for convenience
pub use client::Client;
pub use config::{Config, ServiceType};
pub use error::Error;
pub use paging::{DeleteRangePager, ListTablesPager, TableUsagePager};
pub use query::{PreparedStatement, QueryRequest, QueryResult};
pub use requests::{
    BatchOperation, Consistency, DeleteRequest, FieldRange, GetRequest, GetTableRequest,
    ListTablesRequest, MultiDeleteRequest, PrepareRequest, PutOption, PutRequest, SystemRequest,
    SystemStatusRequest, TableRequest, TableUsageRequest, TimeToLive, WriteMultipleRequest,
};
pub use results::{
    BatchOperationResult, ConsumedCapacity, DeleteResult, GetResult, ListTablesResult,
    MultiDeleteResult, PrepareResult, PutResult, SystemResult, SystemState, TableUsage,
    TableUsageResult, WriteMultipleResult,
};
pub use table::{CapacityMode, TableLimits, TableResult, TableState};
pub use value::{FieldValue, MapValue, Version};
