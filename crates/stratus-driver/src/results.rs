//! Typed operation results and the internal tagged outcome.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::query::{PreparedStatement, TopologyInfo};
use crate::table::TableResult;
use crate::value::{FieldValue, MapValue, Version};

/// Server-reported capacity charged by an operation, plus any time the
/// driver's own rate limiters delayed it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumedCapacity {
    pub read_units: u32,
    pub read_kb: u32,
    pub write_units: u32,
    pub write_kb: u32,
    pub read_rate_limit_delay: Duration,
    pub write_rate_limit_delay: Duration,
}

impl ConsumedCapacity {
    pub fn add(&mut self, other: &ConsumedCapacity) {
        self.read_units += other.read_units;
        self.read_kb += other.read_kb;
        self.write_units += other.write_units;
        self.write_kb += other.write_kb;
        self.read_rate_limit_delay += other.read_rate_limit_delay;
        self.write_rate_limit_delay += other.write_rate_limit_delay;
    }
}

/// Result of a Get.
#[derive(Debug, Clone, Default)]
pub struct GetResult {
    pub row: Option<MapValue>,
    pub version: Option<Version>,
    pub modification_time: Option<DateTime<Utc>>,
    pub consumed: Option<ConsumedCapacity>,
}

/// Result of a Put.
#[derive(Debug, Clone, Default)]
pub struct PutResult {
    /// Whether the write happened (a conditional put may decline).
    pub success: bool,
    pub version: Option<Version>,
    /// Value filled in for an identity/generated column, if any.
    pub generated_value: Option<FieldValue>,
    /// Prior row, when a conditional put failed and return-row was set.
    pub existing_row: Option<MapValue>,
    pub existing_version: Option<Version>,
    pub consumed: Option<ConsumedCapacity>,
}

/// Result of a Delete.
#[derive(Debug, Clone, Default)]
pub struct DeleteResult {
    pub success: bool,
    pub existing_row: Option<MapValue>,
    pub existing_version: Option<Version>,
    pub consumed: Option<ConsumedCapacity>,
}

/// Per-entry outcome inside a [`WriteMultipleResult`].
#[derive(Debug, Clone, Default)]
pub struct BatchOperationResult {
    pub success: bool,
    pub version: Option<Version>,
    pub generated_value: Option<FieldValue>,
    pub existing_row: Option<MapValue>,
    pub existing_version: Option<Version>,
}

/// Result of a WriteMultiple.
#[derive(Debug, Clone, Default)]
pub struct WriteMultipleResult {
    /// One entry per submitted operation; empty if the batch aborted.
    pub results: Vec<BatchOperationResult>,
    /// Index of the entry that aborted the batch, if any.
    pub failed_operation_index: Option<usize>,
    pub consumed: Option<ConsumedCapacity>,
}

impl WriteMultipleResult {
    pub fn succeeded(&self) -> bool {
        self.failed_operation_index.is_none()
    }
}

/// Result of a MultiDelete.
#[derive(Debug, Clone, Default)]
pub struct MultiDeleteResult {
    pub num_deleted: u64,
    /// Present when the write-KB cap stopped the delete early; pass it back
    /// verbatim to resume.
    pub continuation_key: Option<Vec<u8>>,
    pub consumed: Option<ConsumedCapacity>,
}

/// Result of a Prepare.
#[derive(Debug, Clone)]
pub struct PrepareResult {
    pub prepared_statement: PreparedStatement,
    pub consumed: Option<ConsumedCapacity>,
}

/// Result of a ListTables.
#[derive(Debug, Clone, Default)]
pub struct ListTablesResult {
    pub tables: Vec<String>,
    /// Pass as the next request's start index to continue listing.
    pub last_returned_index: u32,
}

/// One throughput usage record.
#[derive(Debug, Clone, Default)]
pub struct TableUsage {
    pub start_time: Option<DateTime<Utc>>,
    pub seconds_in_period: u32,
    pub read_units: u32,
    pub write_units: u32,
    pub storage_gb: u32,
    pub read_throttle_count: u32,
    pub write_throttle_count: u32,
}

/// Result of a TableUsage request.
#[derive(Debug, Clone, Default)]
pub struct TableUsageResult {
    pub table_name: String,
    pub usage_records: Vec<TableUsage>,
    pub last_returned_index: u32,
}

/// Completion state of an admin operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Complete,
    Working,
}

/// Result of a System or SystemStatus request.
#[derive(Debug, Clone)]
pub struct SystemResult {
    pub state: SystemState,
    pub operation_id: Option<String>,
    pub statement: Option<String>,
    /// Statement output (e.g. a listing), when the operation produces one.
    pub result_string: Option<String>,
}

/// Parallel arrays describing phase 1 of a sorted all-partition query.
/// Lengths must agree; the decoder enforces it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Phase1Results {
    pub in_phase1: bool,
    pub partition_ids: Vec<i32>,
    pub num_results_per_partition: Vec<u32>,
    pub continuation_keys: Vec<Option<Vec<u8>>>,
}

/// The raw outcome of one query server round trip, before the client-side
/// plan consumes it.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryBatch {
    pub rows: Vec<MapValue>,
    pub continuation_key: Option<Vec<u8>>,
    pub reached_limit: bool,
    /// Compiled statement, present when the fetch carried a bare statement.
    pub prepared: Option<PreparedStatement>,
    pub topology: Option<TopologyInfo>,
    pub phase1: Option<Phase1Results>,
    pub consumed: Option<ConsumedCapacity>,
}

/// Tagged union of every operation result.
#[derive(Debug, Clone)]
pub(crate) enum OpOutcome {
    Get(GetResult),
    Put(PutResult),
    Delete(DeleteResult),
    WriteMultiple(WriteMultipleResult),
    MultiDelete(MultiDeleteResult),
    Prepare(PrepareResult),
    QueryBatch(QueryBatch),
    Table(TableResult),
    ListTables(ListTablesResult),
    TableUsage(TableUsageResult),
    System(SystemResult),
}

macro_rules! outcome_downcast {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(self) -> Result<$ty, Error> {
            match self {
                OpOutcome::$variant(r) => Ok(r),
                other => Err(Error::BadProtocol(format!(
                    concat!("expected ", stringify!($variant), " result, got {}"),
                    other.kind()
                ))),
            }
        }
    };
}

impl OpOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            OpOutcome::Get(_) => "Get",
            OpOutcome::Put(_) => "Put",
            OpOutcome::Delete(_) => "Delete",
            OpOutcome::WriteMultiple(_) => "WriteMultiple",
            OpOutcome::MultiDelete(_) => "MultiDelete",
            OpOutcome::Prepare(_) => "Prepare",
            OpOutcome::QueryBatch(_) => "Query",
            OpOutcome::Table(_) => "Table",
            OpOutcome::ListTables(_) => "ListTables",
            OpOutcome::TableUsage(_) => "TableUsage",
            OpOutcome::System(_) => "System",
        }
    }

    pub fn consumed(&self) -> Option<&ConsumedCapacity> {
        match self {
            OpOutcome::Get(r) => r.consumed.as_ref(),
            OpOutcome::Put(r) => r.consumed.as_ref(),
            OpOutcome::Delete(r) => r.consumed.as_ref(),
            OpOutcome::WriteMultiple(r) => r.consumed.as_ref(),
            OpOutcome::MultiDelete(r) => r.consumed.as_ref(),
            OpOutcome::Prepare(r) => r.consumed.as_ref(),
            OpOutcome::QueryBatch(r) => r.consumed.as_ref(),
            _ => None,
        }
    }

    pub fn consumed_mut(&mut self) -> Option<&mut ConsumedCapacity> {
        match self {
            OpOutcome::Get(r) => r.consumed.as_mut(),
            OpOutcome::Put(r) => r.consumed.as_mut(),
            OpOutcome::Delete(r) => r.consumed.as_mut(),
            OpOutcome::WriteMultiple(r) => r.consumed.as_mut(),
            OpOutcome::MultiDelete(r) => r.consumed.as_mut(),
            OpOutcome::Prepare(r) => r.consumed.as_mut(),
            OpOutcome::QueryBatch(r) => r.consumed.as_mut(),
            _ => None,
        }
    }

    outcome_downcast!(into_get, Get, GetResult);
    outcome_downcast!(into_put, Put, PutResult);
    outcome_downcast!(into_delete, Delete, DeleteResult);
    outcome_downcast!(into_write_multiple, WriteMultiple, WriteMultipleResult);
    outcome_downcast!(into_multi_delete, MultiDelete, MultiDeleteResult);
    outcome_downcast!(into_prepare, Prepare, PrepareResult);
    outcome_downcast!(into_query_batch, QueryBatch, QueryBatch);
    outcome_downcast!(into_table, Table, TableResult);
    outcome_downcast!(into_list_tables, ListTables, ListTablesResult);
    outcome_downcast!(into_table_usage, TableUsage, TableUsageResult);
    outcome_downcast!(into_system, System, SystemResult);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumed_capacity_accumulates() {
        let mut total = ConsumedCapacity::default();
        total.add(&ConsumedCapacity {
            read_units: 2,
            read_kb: 1,
            write_units: 3,
            write_kb: 3,
            read_rate_limit_delay: Duration::from_millis(5),
            write_rate_limit_delay: Duration::ZERO,
        });
        total.add(&ConsumedCapacity {
            read_units: 1,
            ..Default::default()
        });
        assert_eq!(total.read_units, 3);
        assert_eq!(total.write_units, 3);
        assert_eq!(total.read_rate_limit_delay, Duration::from_millis(5));
    }

    #[test]
    fn downcast_mismatch_is_bad_protocol() {
        let outcome = OpOutcome::Get(GetResult::default());
        assert!(matches!(
            outcome.into_put(),
            Err(Error::BadProtocol(_))
        ));
    }
}
