//! Query execution: prepared statements, the client-side plan runtime, and
//! the batched query API.
//!
//! A "simple" query is executed entirely by the server; the driver just
//! forwards continuation keys. An "advanced" query (sorting, grouping,
//! aggregation over shards) comes back from `Prepare` with a plan tree the
//! driver must run; each user call drives the tree until it needs another
//! server round trip.

pub(crate) mod plan;
pub(crate) mod receive;
pub(crate) mod runtime;
pub(crate) mod sfw;
pub(crate) mod sort;

mod group;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::error::{Error, arg_err};
use crate::protocol::decode_opt_binary;
use crate::requests::{Consistency, QueryFetch};
use crate::results::{ConsumedCapacity, QueryBatch};
use crate::value::{FieldValue, MapValue};

use plan::PlanStep;
use receive::ReceiveIter;
use runtime::{FetchTemplate, QueryRuntime};
use sfw::SfwIter;
use sort::SortIter;
use group::GroupIter;

/// Safety bound on server round trips for one logical query.
const MAX_BATCHES: u32 = 10_000;

/// Shard layout of the store, as known to a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyInfo {
    pub(crate) seq_num: i64,
    pub(crate) shard_ids: Vec<i32>,
}

impl TopologyInfo {
    pub(crate) fn from_wire(j: &Json) -> Result<Option<TopologyInfo>, Error> {
        if j.is_null() {
            return Ok(None);
        }
        let shard_ids = j["shard_ids"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_i64().map(|i| i as i32))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(TopologyInfo {
            seq_num: j["seq_num"].as_i64().unwrap_or(0),
            shard_ids,
        }))
    }
}

/// A server-compiled query.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Opaque compiled form, round-tripped verbatim on every fetch.
    pub(crate) statement: Vec<u8>,
    pub(crate) table_name: Option<String>,
    pub(crate) namespace: Option<String>,
    /// Driver-side plan; `None` for simple queries.
    pub(crate) plan: Option<Arc<PlanStep>>,
    pub(crate) num_registers: usize,
    /// Names of the external variables the statement declares.
    pub(crate) variable_names: Vec<String>,
    pub(crate) topology: Option<TopologyInfo>,
    /// Capacity consumed compiling the statement.
    pub(crate) prepare_cost: Option<ConsumedCapacity>,
}

impl PreparedStatement {
    /// Whether the server executes this query without a driver-side plan.
    pub fn is_simple(&self) -> bool {
        self.plan.is_none()
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn variable_names(&self) -> &[String] {
        &self.variable_names
    }

    pub(crate) fn from_wire(j: &Json) -> Result<PreparedStatement, Error> {
        let statement = decode_opt_binary(&j["statement"])?
            .ok_or_else(|| Error::BadProtocol("prepared statement lacks its body".into()))?;
        let plan = if j["query_plan"].is_null() {
            None
        } else {
            Some(Arc::new(PlanStep::from_wire(&j["query_plan"])?))
        };
        Ok(PreparedStatement {
            statement,
            table_name: j["table_name"].as_str().map(str::to_string),
            namespace: j["namespace"].as_str().map(str::to_string),
            plan,
            num_registers: j["num_registers"].as_u64().unwrap_or(0) as usize,
            variable_names: j["variables"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            topology: TopologyInfo::from_wire(&j["topology"])?,
            prepare_cost: None,
        })
    }
}

/// Dispatch over the row-producing iterators.
pub(crate) enum PlanIter {
    Receive(ReceiveIter),
    Sort(SortIter),
    Group(GroupIter),
    Sfw(SfwIter),
}

impl PlanIter {
    pub fn build(step: &PlanStep) -> PlanIter {
        match step {
            PlanStep::Receive(s) => PlanIter::Receive(ReceiveIter::new(s)),
            PlanStep::Sort(s) => PlanIter::Sort(SortIter::new(s)),
            PlanStep::Group(s) => PlanIter::Group(GroupIter::new(s)),
            PlanStep::Sfw(s) => PlanIter::Sfw(SfwIter::new(s)),
        }
    }

    pub fn result_reg(&self) -> usize {
        match self {
            PlanIter::Receive(it) => it.result_reg(),
            PlanIter::Sort(it) => it.result_reg(),
            PlanIter::Group(it) => it.result_reg(),
            PlanIter::Sfw(it) => it.result_reg(),
        }
    }

    pub fn next<'a>(
        &'a mut self,
        rt: &'a mut QueryRuntime,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        match self {
            PlanIter::Receive(it) => Box::pin(it.next(rt)),
            PlanIter::Sort(it) => Box::pin(it.next(rt)),
            PlanIter::Group(it) => Box::pin(it.next(rt)),
            PlanIter::Sfw(it) => Box::pin(it.next(rt)),
        }
    }
}

/// The plan tree plus its runtime, persisted across calls.
struct QueryDriver {
    runtime: QueryRuntime,
    root: PlanIter,
}

/// A SQL query, either a bare statement or a prepared one with bound
/// variables. The request accumulates execution state across calls; do not
/// share one instance between concurrent calls.
pub struct QueryRequest {
    statement: Option<String>,
    prepared: Option<PreparedStatement>,
    bind_variables: Vec<(String, FieldValue)>,
    consistency: Consistency,
    max_read_kb: u32,
    limit: Option<u32>,
    max_memory: Option<u64>,
    pub(crate) timeout: Option<Duration>,

    driver: Option<QueryDriver>,
    simple_continuation: Option<Vec<u8>>,
    buffered: Vec<MapValue>,
    done: bool,
    batch_counter: u32,
    consumed_total: ConsumedCapacity,
}

impl QueryRequest {
    pub fn new(statement: &str) -> Self {
        QueryRequest {
            statement: Some(statement.to_string()),
            prepared: None,
            bind_variables: Vec::new(),
            consistency: Consistency::default(),
            max_read_kb: 0,
            limit: None,
            max_memory: None,
            timeout: None,
            driver: None,
            simple_continuation: None,
            buffered: Vec::new(),
            done: false,
            batch_counter: 0,
            consumed_total: ConsumedCapacity::default(),
        }
    }

    pub fn new_prepared(prepared: &PreparedStatement) -> Self {
        let mut req = QueryRequest::new("");
        req.statement = None;
        req.prepared = Some(prepared.clone());
        req
    }

    pub fn consistency(mut self, c: Consistency) -> Self {
        self.consistency = c;
        self
    }

    pub fn max_read_kb(mut self, kb: u32) -> Self {
        self.max_read_kb = kb;
        self
    }

    /// Cap the number of rows returned by one call.
    pub fn limit(mut self, rows: u32) -> Self {
        self.limit = Some(rows);
        self
    }

    /// Override the client-wide query memory budget.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }

    /// Bind an external variable of a prepared statement.
    pub fn set_variable(
        &mut self,
        name: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), Error> {
        if self.prepared.is_none() {
            return arg_err!("cannot bind variables: the query is not prepared");
        }
        let value = value.into();
        if let Some(slot) = self.bind_variables.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.bind_variables.push((name.to_string(), value));
        }
        Ok(())
    }

    /// Whether the query has returned everything.
    pub fn is_done(&self) -> bool {
        self.done && self.buffered.is_empty()
    }

    /// The statement's compiled form, once known.
    pub fn prepared_statement(&self) -> Option<&PreparedStatement> {
        self.prepared.as_ref()
    }

    /// Capacity consumed across every call made so far.
    pub fn consumed_total(&self) -> &ConsumedCapacity {
        &self.consumed_total
    }

    /// Variables must match the declared list exactly: nothing missing,
    /// nothing extra.
    fn validate_bindings(&self, prepared: &PreparedStatement) -> Result<(), Error> {
        for declared in &prepared.variable_names {
            if !self.bind_variables.iter().any(|(n, _)| n == declared) {
                return arg_err!("external variable {declared} is not bound");
            }
        }
        for (bound, _) in &self.bind_variables {
            if !prepared.variable_names.iter().any(|n| n == bound) {
                return arg_err!("{bound} is not a variable of this statement");
            }
        }
        Ok(())
    }

    fn simple_fetch(&self, client: &Client, continuation: Option<Vec<u8>>) -> QueryFetch {
        let (prepared_bytes, table_name) = match &self.prepared {
            Some(p) => (Some(p.statement.clone()), p.table_name.clone()),
            None => (None, None),
        };
        QueryFetch {
            table_name,
            statement: self.statement.clone(),
            prepared: prepared_bytes,
            bind_variables: self.bind_variables.clone(),
            continuation_key: continuation,
            shard_id: None,
            number_limit: self.limit,
            max_read_kb: self.max_read_kb,
            consistency: self.consistency,
            timeout: Some(self.effective_timeout(client)),
        }
    }

    fn effective_timeout(&self, client: &Client) -> Duration {
        self.timeout.unwrap_or(client.config().timeout)
    }

    fn make_driver(&mut self, client: &Client) -> Result<(), Error> {
        let prepared = self.prepared.as_ref().expect("driver needs a statement");
        self.validate_bindings(prepared)?;
        let plan = prepared.plan.clone().expect("driver needs a plan");

        let template = FetchTemplate {
            table_name: prepared.table_name.clone(),
            prepared: prepared.statement.clone(),
            bind_variables: self.bind_variables.clone(),
            consistency: self.consistency,
            max_read_kb: self.max_read_kb,
        };
        let max_memory = self.max_memory.unwrap_or(client.config().max_memory);
        let mut runtime = QueryRuntime::new(
            client.clone(),
            template,
            prepared.num_registers,
            self.bind_variables.clone(),
            prepared.topology.clone(),
            max_memory,
        );
        // Driver-side execution charges a flat unit for binding the plan.
        runtime.add_consumed(&ConsumedCapacity {
            read_units: 1,
            read_kb: 1,
            ..Default::default()
        });
        if let Some(cost) = &prepared.prepare_cost {
            runtime.add_consumed(cost);
        }
        self.driver = Some(QueryDriver {
            root: PlanIter::build(&plan),
            runtime,
        });
        debug!(
            table = prepared.table_name.as_deref().unwrap_or(""),
            registers = prepared.num_registers,
            "query driver created"
        );
        Ok(())
    }
}

/// Rows and capacity from one query call. Continuation is tracked on the
/// [`QueryRequest`]: keep calling until [`QueryRequest::is_done`].
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    rows: Vec<MapValue>,
    consumed: Option<ConsumedCapacity>,
}

impl QueryResult {
    pub fn rows(&self) -> &[MapValue] {
        &self.rows
    }

    pub fn take_rows(&mut self) -> Vec<MapValue> {
        std::mem::take(&mut self.rows)
    }

    pub fn consumed(&self) -> Option<&ConsumedCapacity> {
        self.consumed.as_ref()
    }
}

impl Client {
    /// Run one batch of a query: at most one server round trip. Call until
    /// [`QueryRequest::is_done`]; rows buffered by a failed call are
    /// re-offered by the next one.
    pub async fn query(
        &self,
        req: &mut QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, Error> {
        if req.statement.is_none() && req.prepared.is_none() {
            return arg_err!("query requires a statement or a prepared statement");
        }
        if req.is_done() {
            return Ok(QueryResult::default());
        }
        req.batch_counter += 1;
        if req.batch_counter > MAX_BATCHES {
            return Err(Error::BadProtocol(format!(
                "query did not converge after {MAX_BATCHES} batches"
            )));
        }

        let mut rows = std::mem::take(&mut req.buffered);
        let outcome = self.query_batch(req, &mut rows, cancel).await;
        match outcome {
            Ok(consumed) => {
                req.consumed_total.add(&consumed);
                Ok(QueryResult {
                    rows,
                    consumed: Some(consumed),
                })
            }
            Err(e) => {
                // Keep anything already materialised; the next call
                // returns it without re-executing.
                req.buffered = rows;
                Err(e)
            }
        }
    }

    /// Run a query to completion, concatenating every batch.
    pub async fn query_all(
        &self,
        req: &mut QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, Error> {
        let mut rows = Vec::new();
        let mut total = ConsumedCapacity::default();
        loop {
            let mut result = self.query(req, cancel).await?;
            rows.append(&mut result.rows);
            if let Some(c) = result.consumed {
                total.add(&c);
            }
            if req.is_done() {
                return Ok(QueryResult {
                    rows,
                    consumed: Some(total),
                });
            }
        }
    }

    async fn query_batch(
        &self,
        req: &mut QueryRequest,
        rows: &mut Vec<MapValue>,
        cancel: &CancellationToken,
    ) -> Result<ConsumedCapacity, Error> {
        // Not yet prepared: the first round trip compiles the statement
        // (and, for simple queries, already returns rows).
        if req.driver.is_none() && req.prepared.is_none() {
            let fetch = req.simple_fetch(self, None);
            let batch = self.fetch_query_batch(fetch, cancel).await?;
            let consumed = batch.consumed.clone().unwrap_or_default();
            let Some(prepared) = batch.prepared.clone() else {
                return Err(Error::BadProtocol(
                    "query response lacks the compiled statement".into(),
                ));
            };
            req.prepared = Some(prepared.clone());
            req.statement = None;
            if prepared.is_simple() {
                absorb_simple_batch(req, rows, batch);
            } else {
                // Advanced query: this round trip only compiled the plan.
                req.make_driver(self)?;
            }
            return Ok(consumed);
        }

        // Prepared simple query: forward continuation keys.
        let is_simple = req.prepared.as_ref().is_some_and(|p| p.is_simple());
        if req.driver.is_none() && is_simple {
            let continuation = req.simple_continuation.take();
            let fetch = req.simple_fetch(self, continuation);
            let batch = self.fetch_query_batch(fetch, cancel).await?;
            let consumed = batch.consumed.clone().unwrap_or_default();
            absorb_simple_batch(req, rows, batch);
            return Ok(consumed);
        }

        if req.driver.is_none() {
            req.make_driver(self)?;
        }

        // Advanced query: drive the plan until it stalls or the per-call
        // row limit is reached.
        let timeout = req.effective_timeout(self);
        let driver = req.driver.as_mut().expect("created above");
        driver.runtime.begin_call(timeout, cancel.clone());

        let mut more = true;
        loop {
            if let Some(limit) = req.limit
                && rows.len() >= limit as usize
            {
                break;
            }
            if !driver.root.next(&mut driver.runtime).await? {
                more = false;
                break;
            }
            match driver.runtime.take_reg(driver.root.result_reg()) {
                FieldValue::Map(m) => rows.push(m),
                other => {
                    return Err(Error::BadProtocol(format!(
                        "query produced a non-record value: {other:?}"
                    )));
                }
            }
        }

        if !more && !driver.runtime.need_continuation {
            req.done = true;
        }
        Ok(driver.runtime.take_consumed())
    }
}

fn absorb_simple_batch(req: &mut QueryRequest, rows: &mut Vec<MapValue>, batch: QueryBatch) {
    rows.extend(batch.rows);
    req.simple_continuation = batch.continuation_key;
    if req.simple_continuation.is_none() {
        req.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::plan::*;
    use super::*;
    use crate::client::test_support::test_client;
    use crate::compare::SortSpec;
    use crate::requests::Op;
    use crate::results::{OpOutcome, Phase1Results};
    use crate::transport::MockExchange;

    fn row(pairs: &[(&str, i64)]) -> MapValue {
        let mut m = MapValue::new();
        for (k, v) in pairs {
            m.put(*k, FieldValue::Long(*v));
        }
        m
    }

    fn batch(rows: Vec<MapValue>, continuation: Option<&[u8]>) -> Result<OpOutcome, Error> {
        Ok(OpOutcome::QueryBatch(QueryBatch {
            rows,
            continuation_key: continuation.map(|c| c.to_vec()),
            consumed: Some(ConsumedCapacity {
                read_units: 1,
                read_kb: 1,
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    fn prepared_with_plan(plan: PlanStep, shards: Option<Vec<i32>>) -> PreparedStatement {
        PreparedStatement {
            statement: b"compiled".to_vec(),
            table_name: Some("t".into()),
            namespace: None,
            plan: Some(Arc::new(plan)),
            num_registers: 8,
            variable_names: Vec::new(),
            topology: shards.map(|shard_ids| TopologyInfo {
                seq_num: 1,
                shard_ids,
            }),
            prepare_cost: None,
        }
    }

    fn receive_step(distribution: Distribution, sort_field: Option<&str>) -> ReceiveStep {
        ReceiveStep {
            result_reg: 0,
            distribution,
            sort_specs: sort_field.map(SortSpec::asc).into_iter().collect(),
            primary_key_fields: Vec::new(),
            eliminate_duplicates: false,
        }
    }

    async fn run_to_completion(
        client: &Client,
        req: &mut QueryRequest,
    ) -> Result<Vec<MapValue>, Error> {
        let result = client.query_all(req, &CancellationToken::new()).await?;
        Ok(result.rows)
    }

    // ── simple queries ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn simple_query_pages_through_continuations() {
        let simple = PreparedStatement {
            plan: None,
            ..prepared_with_plan(
                PlanStep::Receive(receive_step(Distribution::SinglePartition, None)),
                None,
            )
        };
        let first = Ok(OpOutcome::QueryBatch(QueryBatch {
            rows: vec![row(&[("id", 1)])],
            continuation_key: Some(b"ck1".to_vec()),
            prepared: Some(simple),
            consumed: Some(ConsumedCapacity::default()),
            ..Default::default()
        }));
        let mock = MockExchange::new(vec![
            first,
            batch(vec![row(&[("id", 2)])], Some(b"ck2")),
            batch(vec![row(&[("id", 3)])], None),
        ]);
        let client = test_client(mock);

        let mut req = QueryRequest::new("SELECT * FROM t");
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.get("id").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(req.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn continuation_key_round_trips_verbatim() {
        let simple = PreparedStatement {
            plan: None,
            ..prepared_with_plan(
                PlanStep::Receive(receive_step(Distribution::SinglePartition, None)),
                None,
            )
        };
        let first = Ok(OpOutcome::QueryBatch(QueryBatch {
            rows: vec![],
            continuation_key: Some(b"opaque-bytes".to_vec()),
            prepared: Some(simple),
            consumed: None,
            ..Default::default()
        }));
        let mock = MockExchange::new(vec![first, batch(vec![], None)]);
        let ops = mock.ops_handle();
        let client = test_client(mock);

        let mut req = QueryRequest::new("SELECT * FROM t");
        run_to_completion(&client, &mut req).await.unwrap();

        let ops = ops.lock().unwrap();
        match &ops[1] {
            Op::QueryFetch(f) => {
                assert_eq!(f.continuation_key.as_deref(), Some(b"opaque-bytes".as_ref()));
            }
            other => panic!("expected QueryFetch, got {other:?}"),
        }
    }

    // ── S5: sorted merge across three shards ───────────────────────────

    #[tokio::test(start_paused = true)]
    async fn sorted_shards_merge_in_order() {
        let plan = PlanStep::Receive(receive_step(Distribution::AllShards, Some("a")));
        let prepared = prepared_with_plan(plan, Some(vec![0, 1, 2]));

        let shard_rows = |vals: &[i64]| -> Vec<MapValue> {
            vals.iter().map(|v| row(&[("a", *v)])).collect()
        };
        let mock = MockExchange::new(vec![
            batch(shard_rows(&[1, 4, 7]), None),
            batch(shard_rows(&[2, 5, 8]), None),
            batch(shard_rows(&[3, 6, 9]), None),
        ]);
        let ops = mock.ops_handle();
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let got: Vec<i64> = rows.iter().map(|r| r.get("a").unwrap().as_i64().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);

        // Each seed fetch targeted its shard.
        let shards: Vec<Option<i32>> = ops
            .lock()
            .unwrap()
            .iter()
            .map(|op| match op {
                Op::QueryFetch(f) => f.shard_id,
                _ => None,
            })
            .collect();
        assert_eq!(shards, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn sorted_merge_interleaves_refetches() {
        let plan = PlanStep::Receive(receive_step(Distribution::AllShards, Some("a")));
        let prepared = prepared_with_plan(plan, Some(vec![0, 1]));

        let mock = MockExchange::new(vec![
            batch(vec![row(&[("a", 1)])], Some(b"s0")),
            batch(vec![row(&[("a", 2)]), row(&[("a", 5)])], None),
            batch(vec![row(&[("a", 3)])], None),
        ]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let got: Vec<i64> = rows.iter().map(|r| r.get("a").unwrap().as_i64().unwrap()).collect();
        // Shard 0 exhausts its first batch after emitting 1; the refetch
        // returns 3, which merges between 2 and 5.
        assert_eq!(got, vec![1, 2, 3, 5]);
    }

    // ── duplicate elimination ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn duplicate_primary_keys_are_dropped() {
        let step = ReceiveStep {
            eliminate_duplicates: true,
            primary_key_fields: vec!["id".into()],
            ..receive_step(Distribution::SinglePartition, None)
        };
        let prepared = prepared_with_plan(PlanStep::Receive(step), None);

        let mock = MockExchange::new(vec![
            batch(
                vec![row(&[("id", 1)]), row(&[("id", 2)]), row(&[("id", 1)])],
                Some(b"ck"),
            ),
            batch(vec![row(&[("id", 2)]), row(&[("id", 3)])], None),
        ]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.get("id").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    // ── S6: grouping with continuation ─────────────────────────────────

    fn group_sum_plan() -> PlanStep {
        PlanStep::Group(GroupStep {
            result_reg: 1,
            input: Box::new(PlanStep::Receive(receive_step(
                Distribution::SinglePartition,
                None,
            ))),
            num_group_columns: 1,
            column_names: vec!["k".into(), "total".into()],
            aggr_funcs: vec![AggrFunc::Sum],
            is_distinct: false,
            remove_result: false,
            count_memory: true,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn grouped_sums_survive_continuation() {
        let prepared = prepared_with_plan(group_sum_plan(), None);
        let mock = MockExchange::new(vec![
            batch(
                vec![row(&[("k", 1), ("v", 1)]), row(&[("k", 2), ("v", 2)])],
                Some(b"ck"),
            ),
            batch(vec![row(&[("k", 1), ("v", 3)])], None),
        ]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);

        // First call: one round trip, no groups emitted yet.
        let first = client.query(&mut req, &CancellationToken::new()).await.unwrap();
        assert!(first.rows().is_empty());
        assert!(!req.is_done());

        // Second call: input exhausted, groups flow.
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let mut sums: Vec<(i64, i64)> = rows
            .iter()
            .map(|r| {
                (
                    r.get("k").unwrap().as_i64().unwrap(),
                    r.get("total").unwrap().as_i64().unwrap(),
                )
            })
            .collect();
        sums.sort_unstable();
        assert_eq!(sums, vec![(1, 4), (2, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn group_memory_is_budgeted() {
        let prepared = prepared_with_plan(group_sum_plan(), None);
        let mock = MockExchange::new(vec![batch(
            (0..100).map(|i| row(&[("k", i), ("v", 1)])).collect(),
            None,
        )]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared).max_memory(512);
        let err = run_to_completion(&client, &mut req).await.unwrap_err();
        assert!(matches!(err, Error::MemoryExceeded { .. }));
    }

    // ── sort iterator ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn sort_step_orders_collected_rows() {
        let plan = PlanStep::Sort(SortStep {
            result_reg: 1,
            input: Box::new(PlanStep::Receive(receive_step(
                Distribution::SinglePartition,
                None,
            ))),
            specs: vec![SortSpec::asc("a")],
            count_memory: true,
        });
        let prepared = prepared_with_plan(plan, None);
        let mock = MockExchange::new(vec![
            batch(vec![row(&[("a", 3)]), row(&[("a", 1)])], Some(b"ck")),
            batch(vec![row(&[("a", 2)])], None),
        ]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let got: Vec<i64> = rows.iter().map(|r| r.get("a").unwrap().as_i64().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    // ── SFW projection, offset and limit ───────────────────────────────

    fn sfw_project_plan(offset: Option<i64>, limit: Option<i64>) -> PlanStep {
        let expr_of = |n: i64| ExprStep::Const {
            result_reg: 3,
            value: FieldValue::Long(n),
        };
        PlanStep::Sfw(SfwStep {
            result_reg: 2,
            from: Box::new(PlanStep::Receive(receive_step(
                Distribution::SinglePartition,
                None,
            ))),
            column_names: vec!["id".into()],
            columns: vec![ExprStep::Field {
                result_reg: 1,
                input: Box::new(ExprStep::VarRef { result_reg: 0 }),
                field: "id".into(),
            }],
            group_column_count: None,
            offset: offset.map(expr_of),
            limit: limit.map(expr_of),
            is_select_star: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sfw_applies_offset_then_limit() {
        let prepared = prepared_with_plan(sfw_project_plan(Some(2), Some(3)), None);
        let mock = MockExchange::new(vec![batch(
            (1..=10).map(|i| row(&[("id", i)])).collect(),
            None,
        )]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.get("id").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_offset_is_an_argument_error() {
        let prepared = prepared_with_plan(sfw_project_plan(Some(-1), None), None);
        let mock = MockExchange::new(vec![batch(vec![row(&[("id", 1)])], None)]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let err = run_to_completion(&client, &mut req).await.unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_projection_becomes_null() {
        let prepared = prepared_with_plan(sfw_project_plan(None, None), None);
        let mock = MockExchange::new(vec![batch(vec![row(&[("other", 1)])], None)]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&FieldValue::Null));
    }

    // ── SFW grouping mode ──────────────────────────────────────────────

    fn sfw_group_plan() -> PlanStep {
        PlanStep::Sfw(SfwStep {
            result_reg: 2,
            from: Box::new(PlanStep::Receive(receive_step(
                Distribution::SinglePartition,
                None,
            ))),
            column_names: vec!["k".into(), "total".into()],
            columns: vec![
                ExprStep::Field {
                    result_reg: 1,
                    input: Box::new(ExprStep::VarRef { result_reg: 0 }),
                    field: "k".into(),
                },
                ExprStep::Aggr {
                    result_reg: 4,
                    func: AggrFunc::Sum,
                    input: Box::new(ExprStep::Field {
                        result_reg: 3,
                        input: Box::new(ExprStep::VarRef { result_reg: 0 }),
                        field: "v".into(),
                    }),
                },
            ],
            group_column_count: Some(1),
            offset: None,
            limit: None,
            is_select_star: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sfw_grouping_folds_ordered_runs() {
        let prepared = prepared_with_plan(sfw_group_plan(), None);
        let mock = MockExchange::new(vec![batch(
            vec![
                row(&[("k", 1), ("v", 1)]),
                row(&[("k", 1), ("v", 2)]),
                row(&[("k", 2), ("v", 5)]),
            ],
            None,
        )]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let got: Vec<(i64, i64)> = rows
            .iter()
            .map(|r| {
                (
                    r.get("k").unwrap().as_i64().unwrap(),
                    r.get("total").unwrap().as_i64().unwrap(),
                )
            })
            .collect();
        assert_eq!(got, vec![(1, 3), (2, 5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn sfw_grouping_skips_rows_missing_a_group_column() {
        let prepared = prepared_with_plan(sfw_group_plan(), None);
        let mock = MockExchange::new(vec![batch(
            vec![
                row(&[("k", 1), ("v", 1)]),
                row(&[("v", 99)]), // no k: skipped, group continues
                row(&[("k", 1), ("v", 2)]),
            ],
            None,
        )]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("total").unwrap().as_i64(), Some(3));
    }

    // ── all-partition two-phase sort ───────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn all_partition_sort_merges_after_phase1() {
        let plan = PlanStep::Receive(receive_step(Distribution::AllPartitions, Some("a")));
        let prepared = prepared_with_plan(plan, None);

        let phase1 = Ok(OpOutcome::QueryBatch(QueryBatch {
            rows: vec![row(&[("a", 2)]), row(&[("a", 1)]), row(&[("a", 3)])],
            continuation_key: None,
            phase1: Some(Phase1Results {
                in_phase1: false,
                partition_ids: vec![10, 11],
                num_results_per_partition: vec![1, 2],
                continuation_keys: vec![None, None],
            }),
            consumed: Some(ConsumedCapacity::default()),
            ..Default::default()
        }));
        let mock = MockExchange::new(vec![phase1]);
        let client = test_client(mock);

        let mut req = QueryRequest::new_prepared(&prepared);
        let rows = run_to_completion(&client, &mut req).await.unwrap();
        let got: Vec<i64> = rows.iter().map(|r| r.get("a").unwrap().as_i64().unwrap()).collect();
        // Partition 10 holds [2]; partition 11 holds [1, 3]; merged order.
        assert_eq!(got, vec![1, 2, 3]);
    }

    // ── external variables ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn unbound_variable_is_an_argument_error() {
        let mut prepared = prepared_with_plan(sfw_project_plan(None, None), None);
        prepared.variable_names = vec!["$limit".into()];
        let client = test_client(MockExchange::new(vec![]));

        let mut req = QueryRequest::new_prepared(&prepared);
        let err = client
            .query(&mut req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn binding_requires_a_prepared_statement() {
        let mut req = QueryRequest::new("SELECT * FROM t");
        assert!(matches!(
            req.set_variable("$x", 1),
            Err(Error::Argument(_))
        ));
    }

    // ── buffered rows across failures ──────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn rows_survive_a_failed_call() {
        let prepared = prepared_with_plan(
            PlanStep::Receive(receive_step(Distribution::SinglePartition, None)),
            None,
        );
        let mock = MockExchange::new(vec![
            batch(
                (1..=4).map(|i| row(&[("id", i)])).collect(),
                Some(b"ck"),
            ),
            Err(Error::ServiceResponse {
                status: 503,
                message: "unavailable".into(),
            }),
            batch(vec![row(&[("id", 5)])], None),
        ]);
        // Keep the loop from retrying the 503 so the failure surfaces.
        let mut cfg = crate::client::test_support::test_config();
        cfg.retry_handler = Arc::new(crate::retry::DefaultRetryHandler::new(
            0,
            Duration::from_millis(1),
        ));
        let client = crate::client::test_support::test_client_with_config(cfg, mock);

        let mut req = QueryRequest::new_prepared(&prepared).limit(3);
        let cancel = CancellationToken::new();

        // Call 1: fetches four rows, emits three (the per-call limit).
        let r1 = client.query(&mut req, &cancel).await.unwrap();
        assert_eq!(r1.rows().len(), 3);

        // Call 2: emits the leftover row, then the refetch fails; the row
        // stays buffered instead of being lost.
        let err = client.query(&mut req, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::ServiceResponse { status: 503, .. }));

        // Call 3: the buffered row comes back first, then the new batch.
        let r3 = client.query(&mut req, &cancel).await.unwrap();
        let ids: Vec<i64> = r3.rows().iter().map(|r| r.get("id").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ids, vec![4, 5]);
    }
}
