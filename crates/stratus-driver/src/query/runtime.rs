//! Shared state of one query execution.
//!
//! The runtime owns the register file the iterators communicate through,
//! the memory budget, the consumed-capacity tally, and the one-fetch-per-
//! call latch. It lives inside the `QueryRequest` across calls; per-call
//! state (deadline, cancellation, latch) is reset by `begin_call`.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::client::Client;
use crate::error::Error;
use crate::query::TopologyInfo;
use crate::requests::{Consistency, QueryFetch};
use crate::results::{ConsumedCapacity, QueryBatch};
use crate::value::FieldValue;

/// Constant parts of every fetch a query issues.
#[derive(Debug, Clone)]
pub(crate) struct FetchTemplate {
    pub table_name: Option<String>,
    pub prepared: Vec<u8>,
    pub bind_variables: Vec<(String, FieldValue)>,
    pub consistency: Consistency,
    pub max_read_kb: u32,
}

/// Per-fetch overrides supplied by the receive iterator.
#[derive(Debug, Clone, Default)]
pub(crate) struct FetchArgs {
    pub continuation_key: Option<Vec<u8>>,
    pub shard_id: Option<i32>,
    pub number_limit: Option<u32>,
}

pub(crate) struct QueryRuntime {
    client: Client,
    template: FetchTemplate,
    pub registers: Vec<FieldValue>,
    pub external_vars: Vec<(String, FieldValue)>,
    pub topology: Option<TopologyInfo>,
    pub max_memory: u64,
    total_memory: u64,
    consumed: ConsumedCapacity,
    /// One server round trip is allowed per user call; set when it is used.
    pub fetch_done: bool,
    /// Set when an iterator needed a fetch it could not make this call;
    /// the caller must issue another call to make progress.
    pub need_continuation: bool,
    deadline: Instant,
    cancel: CancellationToken,
}

impl QueryRuntime {
    pub fn new(
        client: Client,
        template: FetchTemplate,
        num_registers: usize,
        external_vars: Vec<(String, FieldValue)>,
        topology: Option<TopologyInfo>,
        max_memory: u64,
    ) -> Self {
        QueryRuntime {
            client,
            template,
            registers: vec![FieldValue::Uninitialized; num_registers],
            external_vars,
            topology,
            max_memory,
            total_memory: 0,
            consumed: ConsumedCapacity::default(),
            fetch_done: false,
            need_continuation: false,
            deadline: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Reset per-call state. Memory, registers, and partial results carry
    /// over between calls; the fetch latch does not.
    pub fn begin_call(&mut self, timeout: Duration, cancel: CancellationToken) {
        self.fetch_done = false;
        self.need_continuation = false;
        self.deadline = Instant::now() + timeout;
        self.cancel = cancel;
    }

    // ── registers ──────────────────────────────────────────────────────

    pub fn get_reg(&self, reg: usize) -> &FieldValue {
        &self.registers[reg]
    }

    pub fn take_reg(&mut self, reg: usize) -> FieldValue {
        std::mem::take(&mut self.registers[reg])
    }

    pub fn set_reg(&mut self, reg: usize, value: FieldValue) {
        self.registers[reg] = value;
    }

    // ── memory budget ──────────────────────────────────────────────────

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Charge bytes against the budget.
    pub fn charge_memory(&mut self, bytes: u64) -> Result<(), Error> {
        self.adjust_memory(bytes as i64)
    }

    /// Adjust the tally by a signed delta (aggregate slots shrink too).
    pub fn adjust_memory(&mut self, delta: i64) -> Result<(), Error> {
        self.total_memory = self.total_memory.saturating_add_signed(delta);
        if self.total_memory > self.max_memory {
            return Err(Error::MemoryExceeded {
                used: self.total_memory,
                budget: self.max_memory,
            });
        }
        Ok(())
    }

    // ── capacity tally ─────────────────────────────────────────────────

    pub fn add_consumed(&mut self, c: &ConsumedCapacity) {
        self.consumed.add(c);
    }

    /// Drain the capacity consumed since the last drain (one user call).
    pub fn take_consumed(&mut self) -> ConsumedCapacity {
        std::mem::take(&mut self.consumed)
    }

    // ── fetching ───────────────────────────────────────────────────────

    /// Claim the call's single server round trip. On failure the caller
    /// must give up for this call; the continuation flag is already set.
    pub fn try_claim_fetch(&mut self) -> bool {
        if self.fetch_done {
            self.need_continuation = true;
            return false;
        }
        true
    }

    /// Issue one fetch. Callers must have claimed the round trip via
    /// [`QueryRuntime::try_claim_fetch`].
    pub async fn fetch(&mut self, args: FetchArgs) -> Result<QueryBatch, Error> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout {
                elapsed: Duration::ZERO,
                retries: 0,
                cause: None,
            });
        }
        self.fetch_done = true;

        let fetch = QueryFetch {
            table_name: self.template.table_name.clone(),
            statement: None,
            prepared: Some(self.template.prepared.clone()),
            bind_variables: self.template.bind_variables.clone(),
            continuation_key: args.continuation_key,
            shard_id: args.shard_id,
            number_limit: args.number_limit,
            max_read_kb: self.template.max_read_kb,
            consistency: self.template.consistency,
            timeout: Some(remaining),
        };
        let client = self.client.clone();
        let cancel = self.cancel.clone();
        let batch = client.fetch_query_batch(fetch, &cancel).await?;

        if let Some(c) = &batch.consumed {
            self.consumed.add(c);
        }
        if let Some(topo) = &batch.topology {
            let newer = match &self.topology {
                None => true,
                Some(old) => topo.seq_num >= old.seq_num,
            };
            if newer {
                trace!(seq = topo.seq_num, shards = topo.shard_ids.len(), "topology updated");
                self.topology = Some(topo.clone());
            }
        }
        Ok(batch)
    }
}
