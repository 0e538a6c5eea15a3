//! Typed operation descriptors.
//!
//! Each public request struct is built with owned-`self` setters and
//! validated once per call. Internally every request becomes one arm of the
//! [`Op`] enum, so the execution loop, serializer and rate-limiting layer
//! branch on a tag instead of downcasting concrete types.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, arg_err};
use crate::table::TableLimits;
use crate::value::{FieldValue, MapValue, Version};

/// Read consistency for Get and Query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    #[default]
    Eventual,
    Absolute,
}

/// Row time-to-live, in whole hours or days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeToLive {
    Hours(u32),
    Days(u32),
    /// Clear any TTL on the row.
    DoNotExpire,
}

/// Conditional behavior of a Put.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOption {
    /// Succeed only if the row does not exist.
    IfAbsent,
    /// Succeed only if the row exists.
    IfPresent,
    /// Succeed only if the row exists at exactly this version.
    IfVersion(Version),
}

/// An inclusive/exclusive bound pair over one field, for ranged deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRange {
    pub field: String,
    pub start: Option<(FieldValue, bool)>,
    pub end: Option<(FieldValue, bool)>,
}

impl FieldRange {
    pub fn new(field: &str) -> Self {
        FieldRange {
            field: field.to_string(),
            start: None,
            end: None,
        }
    }

    pub fn start(mut self, value: impl Into<FieldValue>, inclusive: bool) -> Self {
        self.start = Some((value.into(), inclusive));
        self
    }

    pub fn end(mut self, value: impl Into<FieldValue>, inclusive: bool) -> Self {
        self.end = Some((value.into(), inclusive));
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.field.is_empty() {
            return arg_err!("field range requires a field name");
        }
        if self.start.is_none() && self.end.is_none() {
            return arg_err!("field range requires at least one bound");
        }
        Ok(())
    }
}

/// Read a single row by primary key.
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub(crate) table_name: String,
    pub(crate) key: MapValue,
    pub(crate) consistency: Consistency,
    pub(crate) timeout: Option<Duration>,
}

impl GetRequest {
    pub fn new(table_name: &str, key: MapValue) -> Self {
        GetRequest {
            table_name: table_name.to_string(),
            key,
            consistency: Consistency::default(),
            timeout: None,
        }
    }

    pub fn consistency(mut self, c: Consistency) -> Self {
        self.consistency = c;
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// Write a single row.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub(crate) table_name: String,
    pub(crate) row: MapValue,
    pub(crate) option: Option<PutOption>,
    pub(crate) ttl: Option<TimeToLive>,
    pub(crate) return_row: bool,
    pub(crate) timeout: Option<Duration>,
}

impl PutRequest {
    pub fn new(table_name: &str, row: MapValue) -> Self {
        PutRequest {
            table_name: table_name.to_string(),
            row,
            option: None,
            ttl: None,
            return_row: false,
            timeout: None,
        }
    }

    pub fn if_absent(mut self) -> Self {
        self.option = Some(PutOption::IfAbsent);
        self
    }

    pub fn if_present(mut self) -> Self {
        self.option = Some(PutOption::IfPresent);
        self
    }

    pub fn if_version(mut self, version: Version) -> Self {
        self.option = Some(PutOption::IfVersion(version));
        self
    }

    pub fn ttl(mut self, ttl: TimeToLive) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// On a failed conditional put, return the existing row and version.
    pub fn return_row(mut self, yes: bool) -> Self {
        self.return_row = yes;
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// Delete a single row by primary key.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub(crate) table_name: String,
    pub(crate) key: MapValue,
    pub(crate) match_version: Option<Version>,
    pub(crate) return_row: bool,
    pub(crate) timeout: Option<Duration>,
}

impl DeleteRequest {
    pub fn new(table_name: &str, key: MapValue) -> Self {
        DeleteRequest {
            table_name: table_name.to_string(),
            key,
            match_version: None,
            return_row: false,
            timeout: None,
        }
    }

    pub fn match_version(mut self, version: Version) -> Self {
        self.match_version = Some(version);
        self
    }

    pub fn return_row(mut self, yes: bool) -> Self {
        self.return_row = yes;
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// One entry of a [`WriteMultipleRequest`].
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub(crate) op: BatchOpKind,
    /// Abort the whole batch if this entry fails.
    pub(crate) abort_on_fail: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum BatchOpKind {
    Put(PutRequest),
    Delete(DeleteRequest),
}

impl BatchOperation {
    pub fn put(req: PutRequest) -> Self {
        BatchOperation {
            op: BatchOpKind::Put(req),
            abort_on_fail: false,
        }
    }

    pub fn delete(req: DeleteRequest) -> Self {
        BatchOperation {
            op: BatchOpKind::Delete(req),
            abort_on_fail: false,
        }
    }

    pub fn abort_on_fail(mut self, yes: bool) -> Self {
        self.abort_on_fail = yes;
        self
    }

    fn table_name(&self) -> &str {
        match &self.op {
            BatchOpKind::Put(p) => &p.table_name,
            BatchOpKind::Delete(d) => &d.table_name,
        }
    }
}

/// Atomically apply several puts/deletes sharing one shard key.
#[derive(Debug, Clone)]
pub struct WriteMultipleRequest {
    pub(crate) table_name: String,
    pub(crate) operations: Vec<BatchOperation>,
    pub(crate) timeout: Option<Duration>,
}

impl WriteMultipleRequest {
    pub fn new(table_name: &str) -> Self {
        WriteMultipleRequest {
            table_name: table_name.to_string(),
            operations: Vec::new(),
            timeout: None,
        }
    }

    pub fn add(mut self, op: BatchOperation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// Delete a range of rows sharing a partial primary key.
#[derive(Debug, Clone)]
pub struct MultiDeleteRequest {
    pub(crate) table_name: String,
    pub(crate) key: MapValue,
    pub(crate) range: Option<FieldRange>,
    pub(crate) max_write_kb: u32,
    pub(crate) continuation_key: Option<Vec<u8>>,
    pub(crate) timeout: Option<Duration>,
}

impl MultiDeleteRequest {
    pub fn new(table_name: &str, partial_key: MapValue) -> Self {
        MultiDeleteRequest {
            table_name: table_name.to_string(),
            key: partial_key,
            range: None,
            max_write_kb: 0,
            continuation_key: None,
            timeout: None,
        }
    }

    pub fn range(mut self, range: FieldRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Bound the write KB of one call; the rest is reachable through the
    /// returned continuation key.
    pub fn max_write_kb(mut self, kb: u32) -> Self {
        self.max_write_kb = kb;
        self
    }

    /// Resume a previous, partially complete, ranged delete.
    pub fn continuation_key(mut self, key: Vec<u8>) -> Self {
        self.continuation_key = Some(key);
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// Compile a query statement on the server.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub(crate) statement: String,
    pub(crate) timeout: Option<Duration>,
}

impl PrepareRequest {
    pub fn new(statement: &str) -> Self {
        PrepareRequest {
            statement: statement.to_string(),
            timeout: None,
        }
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// One server round trip of a query: the wire-level fetch issued by the
/// query runtime (and, for simple queries, by `Query` directly).
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryFetch {
    pub table_name: Option<String>,
    /// Set for a not-yet-prepared statement; the response carries the
    /// compiled form.
    pub statement: Option<String>,
    /// Opaque compiled statement bytes from a prior Prepare.
    pub prepared: Option<Vec<u8>>,
    pub bind_variables: Vec<(String, FieldValue)>,
    pub continuation_key: Option<Vec<u8>>,
    /// Restrict the fetch to one shard during a sorted all-shard merge.
    pub shard_id: Option<i32>,
    /// Row-count cap for memory-bounded refetches.
    pub number_limit: Option<u32>,
    pub max_read_kb: u32,
    pub consistency: Consistency,
    pub timeout: Option<Duration>,
}

/// DDL: create/alter/drop a table, or change its limits.
#[derive(Debug, Clone)]
pub struct TableRequest {
    pub(crate) statement: Option<String>,
    pub(crate) table_name: Option<String>,
    pub(crate) limits: Option<TableLimits>,
    pub(crate) timeout: Option<Duration>,
}

impl TableRequest {
    pub fn new(statement: &str) -> Self {
        TableRequest {
            statement: Some(statement.to_string()),
            table_name: None,
            limits: None,
            timeout: None,
        }
    }

    /// Change only the throughput/storage limits of an existing table.
    pub fn set_limits(table_name: &str, limits: TableLimits) -> Self {
        TableRequest {
            statement: None,
            table_name: Some(table_name.to_string()),
            limits: Some(limits),
            timeout: None,
        }
    }

    /// Limits accompanying a CREATE TABLE statement.
    pub fn limits(mut self, limits: TableLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// Fetch table metadata and state.
#[derive(Debug, Clone)]
pub struct GetTableRequest {
    pub(crate) table_name: String,
    pub(crate) operation_id: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl GetTableRequest {
    pub fn new(table_name: &str) -> Self {
        GetTableRequest {
            table_name: table_name.to_string(),
            operation_id: None,
            timeout: None,
        }
    }

    /// Track a specific in-flight DDL operation.
    pub fn operation_id(mut self, id: &str) -> Self {
        self.operation_id = Some(id.to_string());
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// List table names, paged by start index.
#[derive(Debug, Clone, Default)]
pub struct ListTablesRequest {
    pub(crate) start_index: u32,
    pub(crate) limit: u32,
    pub(crate) namespace: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl ListTablesRequest {
    pub fn new() -> Self {
        ListTablesRequest::default()
    }

    pub fn start_index(mut self, i: u32) -> Self {
        self.start_index = i;
        self
    }

    pub fn limit(mut self, n: u32) -> Self {
        self.limit = n;
        self
    }

    pub fn namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// Read table throughput usage records over a time range.
#[derive(Debug, Clone)]
pub struct TableUsageRequest {
    pub(crate) table_name: String,
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    pub(crate) start_index: u32,
    pub(crate) limit: u32,
    pub(crate) timeout: Option<Duration>,
}

impl TableUsageRequest {
    pub fn new(table_name: &str) -> Self {
        TableUsageRequest {
            table_name: table_name.to_string(),
            start_time: None,
            end_time: None,
            start_index: 0,
            limit: 0,
            timeout: None,
        }
    }

    pub fn time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn start_index(mut self, i: u32) -> Self {
        self.start_index = i;
        self
    }

    pub fn limit(mut self, n: u32) -> Self {
        self.limit = n;
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// On-premise administrative DDL (namespaces, users, roles).
#[derive(Debug, Clone)]
pub struct SystemRequest {
    pub(crate) statement: String,
    pub(crate) timeout: Option<Duration>,
}

impl SystemRequest {
    pub fn new(statement: &str) -> Self {
        SystemRequest {
            statement: statement.to_string(),
            timeout: None,
        }
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// Poll the status of an in-flight [`SystemRequest`].
#[derive(Debug, Clone)]
pub struct SystemStatusRequest {
    pub(crate) operation_id: String,
    pub(crate) timeout: Option<Duration>,
}

impl SystemStatusRequest {
    pub fn new(operation_id: &str) -> Self {
        SystemStatusRequest {
            operation_id: operation_id.to_string(),
            timeout: None,
        }
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// The internal tagged form of every operation.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Get(GetRequest),
    Put(PutRequest),
    Delete(DeleteRequest),
    WriteMultiple(WriteMultipleRequest),
    MultiDelete(MultiDeleteRequest),
    Prepare(PrepareRequest),
    QueryFetch(QueryFetch),
    Table(TableRequest),
    GetTable(GetTableRequest),
    ListTables(ListTablesRequest),
    TableUsage(TableUsageRequest),
    System(SystemRequest),
    SystemStatus(SystemStatusRequest),
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Get(_) => "Get",
            Op::Put(_) => "Put",
            Op::Delete(_) => "Delete",
            Op::WriteMultiple(_) => "WriteMultiple",
            Op::MultiDelete(_) => "MultiDelete",
            Op::Prepare(_) => "Prepare",
            Op::QueryFetch(_) => "Query",
            Op::Table(_) => "TableRequest",
            Op::GetTable(_) => "GetTable",
            Op::ListTables(_) => "ListTables",
            Op::TableUsage(_) => "TableUsage",
            Op::System(_) => "System",
            Op::SystemStatus(_) => "SystemStatus",
        }
    }

    /// Table the operation addresses, if any. Absent for prepare, admin and
    /// cross-table listing operations; those are never rate limited.
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Op::Get(r) => Some(&r.table_name),
            Op::Put(r) => Some(&r.table_name),
            Op::Delete(r) => Some(&r.table_name),
            Op::WriteMultiple(r) => Some(&r.table_name),
            Op::MultiDelete(r) => Some(&r.table_name),
            Op::QueryFetch(r) => r.table_name.as_deref(),
            Op::Table(r) => r.table_name.as_deref(),
            Op::GetTable(r) => Some(&r.table_name),
            Op::TableUsage(r) => Some(&r.table_name),
            Op::Prepare(_) | Op::ListTables(_) | Op::System(_) | Op::SystemStatus(_) => None,
        }
    }

    pub fn does_reads(&self) -> bool {
        match self {
            Op::Get(_) | Op::QueryFetch(_) | Op::MultiDelete(_) => true,
            Op::Put(r) => r.return_row || r.option.is_some(),
            Op::Delete(r) => r.return_row || r.match_version.is_some(),
            Op::WriteMultiple(r) => r.operations.iter().any(|o| match &o.op {
                BatchOpKind::Put(p) => p.return_row || p.option.is_some(),
                BatchOpKind::Delete(d) => d.return_row || d.match_version.is_some(),
            }),
            _ => false,
        }
    }

    pub fn does_writes(&self) -> bool {
        matches!(
            self,
            Op::Put(_) | Op::Delete(_) | Op::WriteMultiple(_) | Op::MultiDelete(_)
        ) || matches!(self, Op::QueryFetch(q) if q.statement.as_deref().is_some_and(is_updating_statement))
    }

    /// Lowest serial version able to carry this operation.
    pub fn min_serial_version(&self) -> i16 {
        match self {
            Op::QueryFetch(_) | Op::Prepare(_) => crate::protocol::SERIAL_V3,
            _ => crate::protocol::SERIAL_V2,
        }
    }

    /// One-shot validation, before the first attempt.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Op::Get(r) => {
                require_table(&r.table_name)?;
                require_key(&r.key)
            }
            Op::Put(r) => {
                require_table(&r.table_name)?;
                if r.row.is_empty() {
                    return arg_err!("Put requires a non-empty row");
                }
                Ok(())
            }
            Op::Delete(r) => {
                require_table(&r.table_name)?;
                require_key(&r.key)
            }
            Op::WriteMultiple(r) => {
                require_table(&r.table_name)?;
                if r.operations.is_empty() {
                    return arg_err!("WriteMultiple requires at least one operation");
                }
                for op in &r.operations {
                    if !op.table_name().eq_ignore_ascii_case(&r.table_name) {
                        return arg_err!(
                            "WriteMultiple operations must address table {}, found {}",
                            r.table_name,
                            op.table_name()
                        );
                    }
                }
                Ok(())
            }
            Op::MultiDelete(r) => {
                require_table(&r.table_name)?;
                if let Some(range) = &r.range {
                    range.validate()?;
                }
                Ok(())
            }
            Op::Prepare(r) => require_statement(&r.statement),
            Op::QueryFetch(r) => {
                if r.statement.is_none() && r.prepared.is_none() {
                    return arg_err!("query requires a statement or a prepared statement");
                }
                Ok(())
            }
            Op::Table(r) => {
                if r.statement.is_none() && r.limits.is_none() {
                    return arg_err!("TableRequest requires a statement or limits");
                }
                if r.statement.is_none() && r.table_name.is_none() {
                    return arg_err!("a limits-only TableRequest requires a table name");
                }
                Ok(())
            }
            Op::GetTable(r) => require_table(&r.table_name),
            Op::ListTables(_) => Ok(()),
            Op::TableUsage(r) => {
                require_table(&r.table_name)?;
                if let (Some(s), Some(e)) = (r.start_time, r.end_time)
                    && s > e
                {
                    return arg_err!("usage start time is after end time");
                }
                Ok(())
            }
            Op::System(r) => require_statement(&r.statement),
            Op::SystemStatus(r) => {
                if r.operation_id.is_empty() {
                    return arg_err!("SystemStatus requires an operation id");
                }
                Ok(())
            }
        }
    }

    /// The caller-requested timeout, if one was set on the request.
    pub fn requested_timeout(&self) -> Option<Duration> {
        match self {
            Op::Get(r) => r.timeout,
            Op::Put(r) => r.timeout,
            Op::Delete(r) => r.timeout,
            Op::WriteMultiple(r) => r.timeout,
            Op::MultiDelete(r) => r.timeout,
            Op::Prepare(r) => r.timeout,
            Op::QueryFetch(r) => r.timeout,
            Op::Table(r) => r.timeout,
            Op::GetTable(r) => r.timeout,
            Op::ListTables(r) => r.timeout,
            Op::TableUsage(r) => r.timeout,
            Op::System(r) => r.timeout,
            Op::SystemStatus(r) => r.timeout,
        }
    }
}

fn require_table(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return arg_err!("a table name is required");
    }
    Ok(())
}

fn require_key(key: &MapValue) -> Result<(), Error> {
    if key.is_empty() {
        return arg_err!("a non-empty primary key is required");
    }
    Ok(())
}

fn require_statement(stmt: &str) -> Result<(), Error> {
    if stmt.trim().is_empty() {
        return arg_err!("a statement is required");
    }
    Ok(())
}

/// Queries that modify data charge write units too.
fn is_updating_statement(stmt: &str) -> bool {
    let s = stmt.trim_start();
    ["insert", "upsert", "update", "delete"]
        .iter()
        .any(|kw| s.get(..kw.len()).is_some_and(|p| p.eq_ignore_ascii_case(kw)))
}
